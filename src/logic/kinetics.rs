//! Reference-region Patlak analysis of the TACs.
//!
//! For frame mid-times `t_i` (min): `x_i = ∫₀^{t_i} ref dt / ref_i`,
//! `y_i = target_i / ref_i`. After equilibrium the points fall on a line
//! whose slope is the influx rate relative to the reference region.

use std::path::Path;

use nalgebra::{DMatrix, DVector};
use serde::Serialize;

use crate::error::{PipelineError, Result};
use crate::models::results::{PatlakFit, TacTable};
use crate::utils::plot::{palette, Plot, Series};

/// Fewest frames a regression is attempted on.
pub const MIN_FRAMES: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LinearFit {
    pub slope: f64,
    pub intercept: f64,
    pub r_squared: f64,
}

/// Ordinary least squares of `y` on `x` through the normal equations.
///
/// `None` with fewer than two points or when `x` is constant.
pub fn linear_regression(x: &[f64], y: &[f64]) -> Option<LinearFit> {
    let n = x.len().min(y.len());
    if n < MIN_FRAMES {
        return None;
    }
    let x_mean = x[..n].iter().sum::<f64>() / n as f64;
    if x[..n].iter().all(|v| (v - x_mean).abs() <= f64::EPSILON * x_mean.abs().max(1.0)) {
        return None;
    }
    let design = DMatrix::from_fn(n, 2, |r, c| if c == 0 { x[r] } else { 1.0 });
    let target = DVector::from_column_slice(&y[..n]);
    let normal = design.transpose() * &design;
    let theta = normal.try_inverse()? * design.transpose() * &target;
    let (slope, intercept) = (theta[0], theta[1]);
    if !slope.is_finite() || !intercept.is_finite() {
        return None;
    }

    let mean = target.mean();
    let ss_tot: f64 = target.iter().map(|v| (v - mean).powi(2)).sum();
    let ss_res: f64 = x
        .iter()
        .zip(target.iter())
        .map(|(xi, yi)| (yi - (slope * xi + intercept)).powi(2))
        .sum();
    let r_squared = if ss_tot > 0.0 { 1.0 - ss_res / ss_tot } else { 1.0 };

    Some(LinearFit {
        slope,
        intercept,
        r_squared,
    })
}

/// Patlak coordinates of every usable frame plus the fit over the window.
#[derive(Debug, Clone)]
pub struct PatlakResult {
    pub fit: PatlakFit,
    /// All usable `(x, y)` points.
    pub points: Vec<(f64, f64)>,
    /// Points at or after the cutoff.
    pub window: Vec<(f64, f64)>,
}

/// Patlak plot of `target` against `reference`.
///
/// `mid_min` and `start_min` are frame mid and start times in minutes, sorted.
pub fn reference_patlak(
    mid_min: &[f64],
    start_min: &[f64],
    target: &[f64],
    reference: &[f64],
    cutoff_min: f64,
) -> Result<PatlakResult> {
    let n = mid_min.len();
    if [start_min.len(), target.len(), reference.len()].iter().any(|len| *len != n) {
        return Err(PipelineError::FrameMetadata(format!(
            "Patlak inputs disagree on frame count ({n} times, {} targets, {} references)",
            target.len(),
            reference.len()
        )));
    }

    let mut integral = 0.0;
    let (mut t_prev, mut r_prev) = (0.0, 0.0);
    let mut points = Vec::with_capacity(n);
    let mut window = Vec::with_capacity(n);
    for i in 0..n {
        integral += (mid_min[i] - t_prev) * (reference[i] + r_prev) / 2.0;
        t_prev = mid_min[i];
        r_prev = reference[i];

        let usable = reference[i] > 0.0 && reference[i].is_finite() && target[i].is_finite();
        if !usable {
            continue;
        }
        let point = (integral / reference[i], target[i] / reference[i]);
        if !(point.0.is_finite() && point.1.is_finite()) {
            continue;
        }
        points.push(point);
        if start_min[i] >= cutoff_min {
            window.push(point);
        }
    }

    let insufficient = || PipelineError::InsufficientFrames {
        available: window.len(),
        required: MIN_FRAMES,
        cutoff_min,
    };
    if window.len() < MIN_FRAMES {
        return Err(insufficient());
    }
    let (x, y): (Vec<f64>, Vec<f64>) = window.iter().copied().unzip();
    let line = linear_regression(&x, &y).ok_or_else(insufficient)?;

    Ok(PatlakResult {
        fit: PatlakFit {
            slope: line.slope,
            intercept: line.intercept,
            r_squared: line.r_squared,
            frames_used: window.len(),
            cutoff_min,
        },
        points,
        window,
    })
}

/// Fit `target` labels against `reference` labels of a TAC table.
pub fn fit_patlak(
    tacs: &TacTable,
    target: (&str, &[i32]),
    reference: (&str, &[i32]),
    cutoff_min: f64,
) -> Result<PatlakResult> {
    let roi = tacs.region_curve(target.0, target.1)?;
    let reference = tacs.region_curve(reference.0, reference.1)?;
    reference_patlak(
        &tacs.mid_times_min(),
        &tacs.start_times_min(),
        &roi,
        &reference,
        cutoff_min,
    )
}

/// Scatter of all points with the fitted line over the window.
pub fn plot_regression(result: &PatlakResult, path: &Path) -> Result<()> {
    let fit = &result.fit;
    let line = result
        .window
        .iter()
        .map(|(x, _)| *x)
        .fold(None, |acc: Option<(f64, f64)>, x| match acc {
            None => Some((x, x)),
            Some((lo, hi)) => Some((lo.min(x), hi.max(x))),
        })
        .map(|(lo, hi)| vec![(lo, fit.slope * lo + fit.intercept), (hi, fit.slope * hi + fit.intercept)])
        .unwrap_or_default();

    let mut plot = Plot::new(640, 480);
    plot.add(Series::markers(result.points.clone(), palette(0)))
        .add(Series::markers(result.window.clone(), palette(1)))
        .add(Series::line(line, palette(1)));
    plot.save(path)
}
