use std::fs;
use std::path::Path;

use nalgebra::Matrix4;

use crate::error::{PipelineError, Result};
use crate::resample::{resample, Interpolator};
use crate::volume::Volume;

use super::{RegistrationBackend, RegistrationRequest, ResampleRequest};

const HEADER_LINE: &str = "# affine: reference world -> moving world";

/// In-process backend that trusts the scanner geometry.
///
/// Registration writes identity transforms, so images are aligned through
/// their header affines alone. Resampling composes plain-text affines
/// written by this backend; ANTs transforms are rejected.
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeBackend;

pub(crate) fn write_affine(path: &Path, m: &Matrix4<f64>) -> Result<()> {
    let mut text = String::from(HEADER_LINE);
    text.push('\n');
    for r in 0..4 {
        let row: Vec<String> = (0..4).map(|c| format!("{:.9}", m[(r, c)])).collect();
        text.push_str(&row.join(" "));
        text.push('\n');
    }
    fs::write(path, text)?;
    Ok(())
}

pub(crate) fn read_affine(path: &Path) -> Result<Matrix4<f64>> {
    if path.extension().and_then(|e| e.to_str()) != Some("txt") {
        return Err(PipelineError::UnsupportedTransform(path.to_path_buf()));
    }
    let text = fs::read_to_string(path)?;
    let values: Vec<f64> = text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .flat_map(str::split_whitespace)
        .map(str::parse::<f64>)
        .collect::<std::result::Result<_, _>>()
        .map_err(|_| PipelineError::UnsupportedTransform(path.to_path_buf()))?;
    if values.len() != 16 {
        return Err(PipelineError::UnsupportedTransform(path.to_path_buf()));
    }
    Ok(Matrix4::from_row_slice(&values))
}

impl RegistrationBackend for NativeBackend {
    fn name(&self) -> &'static str {
        "native"
    }

    fn transform_extension(&self) -> &'static str {
        "txt"
    }

    fn register(&self, request: &RegistrationRequest<'_>) -> Result<()> {
        let fixed = Volume::open(request.fixed)?;
        let moving = Volume::open(request.moving)?;
        let identity = Matrix4::identity();

        write_affine(&request.outputs.forward, &identity)?;
        write_affine(&request.outputs.inverse, &identity)?;

        resample(&moving, &fixed.grid(), &[identity], Interpolator::Linear)?
            .save(&request.outputs.moving_in_fixed)?;
        resample(&fixed, &moving.grid(), &[identity], Interpolator::Linear)?
            .save(&request.outputs.fixed_in_moving)?;
        Ok(())
    }

    fn apply(&self, request: &ResampleRequest<'_>) -> Result<()> {
        let chain = request
            .transforms
            .iter()
            .map(|t| read_affine(t))
            .collect::<Result<Vec<_>>>()?;
        let reference = Volume::open(request.reference)?;
        let moving = Volume::open(request.moving)?;
        resample(&moving, &reference.grid(), &chain, request.interpolator)?.save(request.output)
    }
}
