//! Resampling of a volume onto another volume's grid.
//!
//! A transform chain is a list of world-space affines, ordered from the
//! reference space outward: reference points go through `chain[0]` first.

use std::fmt;
use std::str::FromStr;

use nalgebra::{Matrix4, Point3};
use ndarray::{Array3, ArrayView3, Zip};
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::volume::{Grid, Volume};

/// Interpolation used when resampling.
///
/// Label volumes must use `NearestNeighbor` so no new label values appear.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Interpolator {
    Linear,
    NearestNeighbor,
}

impl Interpolator {
    /// Name understood by `antsApplyTransforms -n`.
    pub fn ants_name(&self) -> &'static str {
        match self {
            Self::Linear => "Linear",
            Self::NearestNeighbor => "NearestNeighbor",
        }
    }
}

impl fmt::Display for Interpolator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Linear => f.write_str("linear"),
            Self::NearestNeighbor => f.write_str("nearestNeighbor"),
        }
    }
}

impl FromStr for Interpolator {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "linear" | "Linear" => Ok(Self::Linear),
            "nearestNeighbor" | "NearestNeighbor" => Ok(Self::NearestNeighbor),
            other => Err(PipelineError::Config(format!("unknown interpolator `{other}`"))),
        }
    }
}

/// Compose a chain into one reference-world → moving-world affine.
pub fn compose(chain: &[Matrix4<f64>]) -> Matrix4<f64> {
    chain
        .iter()
        .fold(Matrix4::identity(), |acc, next| next * acc)
}

/// Resample `moving` onto `reference` through `chain`.
///
/// Voxels mapping outside `moving` are set to zero.
pub fn resample(
    moving: &Volume,
    reference: &Grid,
    chain: &[Matrix4<f64>],
    interpolator: Interpolator,
) -> Result<Volume> {
    let moving_grid = moving.grid();
    let world_to_moving = moving_grid.affine.try_inverse().ok_or_else(|| {
        PipelineError::GridMismatch {
            expected: "invertible voxel-to-world affine".into(),
            found: moving_grid.to_string(),
        }
    })?;
    let voxel_map = world_to_moving * compose(chain) * reference.affine;

    let src = moving.data();
    let mut out = Array3::<f32>::zeros(reference.shape);
    Zip::indexed(&mut out).par_for_each(|(i, j, k), o| {
        let p = voxel_map.transform_point(&Point3::new(i as f64, j as f64, k as f64));
        *o = match interpolator {
            Interpolator::NearestNeighbor => sample_nearest(&src, p),
            Interpolator::Linear => sample_linear(&src, p),
        };
    });

    Ok(Volume::from_array(out, reference.affine))
}

/// Clamp `x` into `[0, n - 1]` when it lies within half a voxel of the grid.
#[inline]
fn inside(x: f64, n: usize) -> Option<f64> {
    let upper = n as f64 - 0.5;
    if x < -0.5 || x >= upper {
        None
    } else {
        Some(x.clamp(0.0, (n - 1) as f64))
    }
}

fn sample_nearest(src: &ArrayView3<f32>, p: Point3<f64>) -> f32 {
    let dims = src.dim();
    match (inside(p.x, dims.0), inside(p.y, dims.1), inside(p.z, dims.2)) {
        (Some(x), Some(y), Some(z)) => {
            src[(x.round() as usize, y.round() as usize, z.round() as usize)]
        }
        _ => 0.0,
    }
}

fn sample_linear(src: &ArrayView3<f32>, p: Point3<f64>) -> f32 {
    let dims = src.dim();
    let (x, y, z) = match (inside(p.x, dims.0), inside(p.y, dims.1), inside(p.z, dims.2)) {
        (Some(x), Some(y), Some(z)) => (x, y, z),
        _ => return 0.0,
    };

    let (x0, y0, z0) = (x.floor() as usize, y.floor() as usize, z.floor() as usize);
    let (x1, y1, z1) = (
        (x0 + 1).min(dims.0 - 1),
        (y0 + 1).min(dims.1 - 1),
        (z0 + 1).min(dims.2 - 1),
    );
    let (fx, fy, fz) = (x - x0 as f64, y - y0 as f64, z - z0 as f64);

    let at = |i, j, k| src[(i, j, k)] as f64;
    let c00 = at(x0, y0, z0) * (1.0 - fx) + at(x1, y0, z0) * fx;
    let c10 = at(x0, y1, z0) * (1.0 - fx) + at(x1, y1, z0) * fx;
    let c01 = at(x0, y0, z1) * (1.0 - fx) + at(x1, y0, z1) * fx;
    let c11 = at(x0, y1, z1) * (1.0 - fx) + at(x1, y1, z1) * fx;
    let c0 = c00 * (1.0 - fy) + c10 * fy;
    let c1 = c01 * (1.0 - fy) + c11 * fy;
    (c0 * (1.0 - fz) + c1 * fz) as f32
}
