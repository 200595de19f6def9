//! Alignment of two volumes and resampling through composed transforms.
//!
//! The registration engine itself is external; [`RegistrationBackend`] is the
//! seam. [`align`] and [`transform`] own file naming, caching and QC.

use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::resample::Interpolator;
use crate::utils::qc::{volume_to_gif, GifOptions};

mod ants;
mod native;

pub use ants::AntsBackend;
pub use native::NativeBackend;

/// Closed set of registration methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransformMethod {
    /// Rotation + translation.
    Rigid,
    /// Rigid and affine initialisation followed by an aggressive SyN warp.
    SyNAggro,
}

impl fmt::Display for TransformMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rigid => f.write_str("Rigid"),
            Self::SyNAggro => f.write_str("SyNAggro"),
        }
    }
}

impl FromStr for TransformMethod {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Rigid" => Ok(Self::Rigid),
            "SyNAggro" => Ok(Self::SyNAggro),
            other => Err(PipelineError::Config(format!(
                "unknown transform method `{other}` (expected Rigid or SyNAggro)"
            ))),
        }
    }
}

/// Files produced by one alignment.
///
/// `forward` maps fixed-space points into the moving space, so resampling the
/// moving image onto the fixed grid uses `forward`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Alignment {
    pub moving_in_fixed: PathBuf,
    pub fixed_in_moving: PathBuf,
    pub forward: PathBuf,
    pub inverse: PathBuf,
}

impl Alignment {
    fn at_prefix(prefix: &Path, extension: &str) -> Self {
        Self {
            moving_in_fixed: prefixed(prefix, "fwd.nii.gz"),
            fixed_in_moving: prefixed(prefix, "inv.nii.gz"),
            forward: prefixed(prefix, &format!("Composite.{extension}")),
            inverse: prefixed(prefix, &format!("InverseComposite.{extension}")),
        }
    }

    fn files(&self) -> [&Path; 4] {
        [
            &self.moving_in_fixed,
            &self.fixed_in_moving,
            &self.forward,
            &self.inverse,
        ]
    }
}

/// Input of [`RegistrationBackend::register`].
#[derive(Debug)]
pub struct RegistrationRequest<'a> {
    pub fixed: &'a Path,
    pub moving: &'a Path,
    pub method: TransformMethod,
    pub prefix: &'a Path,
    pub outputs: &'a Alignment,
}

/// Input of [`RegistrationBackend::apply`].
#[derive(Debug)]
pub struct ResampleRequest<'a> {
    pub reference: &'a Path,
    pub moving: &'a Path,
    /// Ordered from the reference space outward.
    pub transforms: &'a [PathBuf],
    pub interpolator: Interpolator,
    pub output: &'a Path,
}

/// An image-registration engine.
pub trait RegistrationBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Extension of the transform files this backend writes.
    fn transform_extension(&self) -> &'static str;

    /// Estimate both transform directions and write the four files of `request.outputs`.
    fn register(&self, request: &RegistrationRequest<'_>) -> Result<()>;

    /// Resample `request.moving` onto the grid of `request.reference`.
    fn apply(&self, request: &ResampleRequest<'_>) -> Result<()>;
}

/// `prefix` with `suffix` appended to its last component.
pub fn prefixed(prefix: &Path, suffix: &str) -> PathBuf {
    let mut s: OsString = prefix.as_os_str().to_owned();
    s.push(suffix);
    PathBuf::from(s)
}

/// Name of the resampled copy of `moving`: `x.nii.gz` → `x_rsl.nii.gz`.
pub fn resampled_name(moving: &Path) -> String {
    let name = moving
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("volume.nii.gz");
    if let Some(stem) = name.strip_suffix(".nii.gz") {
        format!("{stem}_rsl.nii.gz")
    } else if let Some(stem) = name.strip_suffix(".nii") {
        format!("{stem}_rsl.nii")
    } else {
        format!("{name}_rsl.nii.gz")
    }
}

/// Align `moving` to `fixed`.
///
/// Outputs already on disk are reused unless `clobber` is set.
pub fn align(
    backend: &dyn RegistrationBackend,
    fixed: &Path,
    moving: &Path,
    method: TransformMethod,
    prefix: &Path,
    qc: Option<&Path>,
    clobber: bool,
) -> Result<Alignment> {
    let outputs = Alignment::at_prefix(prefix, backend.transform_extension());
    tracing::info!(
        fixed = %fixed.display(),
        moving = %moving.display(),
        %method,
        backend = backend.name(),
        "aligning"
    );

    if !clobber && outputs.files().iter().all(|f| f.exists()) {
        tracing::debug!(prefix = %prefix.display(), "alignment outputs exist, reusing");
        return Ok(outputs);
    }

    backend.register(&RegistrationRequest {
        fixed,
        moving,
        method,
        prefix,
        outputs: &outputs,
    })?;

    if let Some(missing) = outputs.files().into_iter().find(|f| !f.exists()) {
        return Err(PipelineError::registration(
            format!("{method} {} -> {}", moving.display(), fixed.display()),
            format!("malformed output: {} was not written", missing.display()),
        ));
    }

    if let Some(qc) = qc {
        write_qc(fixed, &outputs.moving_in_fixed, qc);
    }
    Ok(outputs)
}

/// Resample `moving` onto `reference` through `transforms`.
///
/// The output is `<prefix><moving name>_rsl.nii.gz`; an existing output is
/// returned untouched unless `clobber` is set.
#[allow(clippy::too_many_arguments)]
pub fn transform(
    backend: &dyn RegistrationBackend,
    prefix: &Path,
    reference: &Path,
    moving: &Path,
    transforms: &[PathBuf],
    interpolator: Interpolator,
    qc: Option<&Path>,
    clobber: bool,
) -> Result<PathBuf> {
    let output = prefixed(prefix, &resampled_name(moving));
    tracing::info!(
        reference = %reference.display(),
        moving = %moving.display(),
        transforms = ?transforms,
        %interpolator,
        "transforming"
    );

    if output.exists() && !clobber {
        tracing::debug!(output = %output.display(), "resampled volume exists, reusing");
        return Ok(output);
    }

    backend.apply(&ResampleRequest {
        reference,
        moving,
        transforms,
        interpolator,
        output: &output,
    })?;

    if !output.exists() {
        return Err(PipelineError::registration(
            format!("resampling {}", moving.display()),
            format!("malformed output: {} was not written", output.display()),
        ));
    }

    if let Some(qc) = qc {
        write_qc(reference, &output, qc);
    }
    Ok(output)
}

fn write_qc(reference: &Path, overlay: &Path, qc: &Path) {
    if let Err(e) = volume_to_gif(reference, overlay, qc, &GifOptions::default()) {
        tracing::warn!(qc = %qc.display(), error = %e, "could not write QC animation");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resampled_names_follow_nifti_extensions() {
        assert_eq!(resampled_name(Path::new("/a/atlas.nii.gz")), "atlas_rsl.nii.gz");
        assert_eq!(resampled_name(Path::new("mask.nii")), "mask_rsl.nii");
        assert_eq!(resampled_name(Path::new("raw.img")), "raw.img_rsl.nii.gz");
    }

    #[test]
    fn alignment_files_hang_off_the_prefix() {
        let a = Alignment::at_prefix(Path::new("/out/sub-01_mri2pet_Rigid_"), "h5");
        assert_eq!(a.moving_in_fixed, PathBuf::from("/out/sub-01_mri2pet_Rigid_fwd.nii.gz"));
        assert_eq!(a.inverse, PathBuf::from("/out/sub-01_mri2pet_Rigid_InverseComposite.h5"));
    }

    #[test]
    fn method_names_round_trip_through_strings() {
        assert_eq!("SyNAggro".parse::<TransformMethod>().unwrap(), TransformMethod::SyNAggro);
        assert!("Affine".parse::<TransformMethod>().is_err());
    }
}
