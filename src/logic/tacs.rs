//! Time-activity curves: mean uptake per atlas label for every PET frame.

use std::collections::HashMap;
use std::path::Path;

use ndarray::{Array3, Zip};
use rayon::prelude::*;
use rayon::ThreadPoolBuilder;

use crate::error::{PipelineError, Result};
use crate::models::frames::{Frame, FrameTiming};
use crate::models::results::{TacFrame, TacTable};
use crate::utils::plot::{palette, Plot, Series};
use crate::utils::tables;
use crate::volume::{Volume, Volume4};

/// Run `f` on a pool of `threads` workers, or on the global pool.
pub(crate) fn with_pool<T, F>(threads: Option<usize>, f: F) -> Result<T>
where
    T: Send,
    F: FnOnce() -> T + Send,
{
    match threads {
        Some(n) => {
            let pool = ThreadPoolBuilder::new()
                .num_threads(n)
                .build()
                .map_err(|e| PipelineError::Config(format!("cannot build a {n}-thread pool: {e}")))?;
            Ok(pool.install(f))
        }
        None => Ok(f()),
    }
}

/// Extract one curve per label in `labels` from `series`.
///
/// Rows follow frame start order; a label with no voxels yields NaN means.
pub fn extract_tacs(
    series: &Volume4,
    label_volume: &Volume,
    labels: &[i32],
    timing: &FrameTiming,
    threads: Option<usize>,
) -> Result<TacTable> {
    timing.ensure_volume_count(series.n_frames())?;
    label_volume.grid().ensure_same(&series.grid())?;

    let column: HashMap<i32, usize> = labels.iter().enumerate().map(|(c, l)| (*l, c)).collect();
    if column.len() != labels.len() {
        return Err(PipelineError::Config(format!("duplicate TAC labels in {labels:?}")));
    }

    let columns: Array3<Option<usize>> = label_volume
        .data()
        .mapv(|v| column.get(&(v.round() as i32)).copied());
    let mut voxel_counts = vec![0usize; labels.len()];
    for c in columns.iter().flatten() {
        voxel_counts[*c] += 1;
    }

    let tac_frame = |frame: &Frame| {
        let mut sums = vec![0.0f64; labels.len()];
        Zip::from(&columns)
            .and(&series.frame(frame.index))
            .for_each(|c, &v| {
                if let Some(c) = c {
                    sums[*c] += v as f64;
                }
            });
        let values = sums
            .iter()
            .zip(&voxel_counts)
            .map(|(s, n)| if *n == 0 { f64::NAN } else { s / *n as f64 })
            .collect();
        TacFrame {
            start_s: frame.start_s,
            duration_s: frame.duration_s,
            values,
        }
    };

    let frames = with_pool(threads, || {
        timing.frames().par_iter().map(tac_frame).collect::<Vec<_>>()
    })?;

    for (label, n) in labels.iter().zip(&voxel_counts) {
        if *n == 0 {
            tracing::warn!(label, "TAC label has no voxels in PET space");
        }
    }

    Ok(TacTable {
        labels: labels.to_vec(),
        voxel_counts,
        frames,
    })
}

pub struct TacOutputs<'a> {
    pub sub_regions_csv: &'a Path,
    pub regions_csv: &'a Path,
    pub overview_png: Option<&'a Path>,
    pub sub_regions_png: Option<&'a Path>,
}

/// Write both TAC tables, then the QC plots. Plot failures are only logged.
pub fn write_tacs(tacs: &TacTable, regions: &[(&str, Vec<f64>)], outputs: &TacOutputs<'_>) -> Result<()> {
    tables::write_tac_sub_regions(outputs.sub_regions_csv, tacs)?;
    tables::write_tac_regions(outputs.regions_csv, tacs, regions)?;

    let times = tacs.mid_times_min();
    if let Some(path) = outputs.overview_png {
        let mut plot = Plot::new(640, 480);
        for (n, (_, curve)) in regions.iter().enumerate() {
            plot.add(Series::line(times.iter().copied().zip(curve.iter().copied()).collect(), palette(n)));
        }
        if let Err(e) = plot.save(path) {
            tracing::warn!(plot = %path.display(), error = %e, "could not write TAC plot");
        }
    }
    if let Some(path) = outputs.sub_regions_png {
        let mut plot = Plot::new(640, 480);
        for (n, label) in tacs.labels.iter().enumerate() {
            if let Some(curve) = tacs.curve(*label) {
                plot.add(Series::line(times.iter().copied().zip(curve).collect(), palette(n)));
            }
        }
        if let Err(e) = plot.save(path) {
            tracing::warn!(plot = %path.display(), error = %e, "could not write TAC plot");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use nalgebra::Matrix4;
    use ndarray::{Array4, Axis};
    use tempfile::tempdir;

    fn labels() -> Volume {
        let data = Array3::from_shape_fn((4, 4, 2), |(i, _, _)| match i {
            0 => 11.0,
            1 => 50.0,
            2 => 1000.0,
            _ => 0.0,
        });
        Volume::from_array(data, Matrix4::identity())
    }

    /// Frame t has uptake `(t + 1) * (i + 1)`.
    fn series(frames: usize) -> Volume4 {
        let mut data = Array4::<f32>::zeros((4, 4, 2, frames));
        for (t, mut frame) in data.axis_iter_mut(Axis(3)).enumerate() {
            frame.indexed_iter_mut().for_each(|((i, _, _), v)| *v = ((t + 1) * (i + 1)) as f32);
        }
        Volume4::from_array(data, Matrix4::identity())
    }

    #[test]
    fn one_row_per_frame_in_start_order() {
        // Volume order is not start order.
        let timing = FrameTiming::new(&[120.0, 0.0, 60.0], &[60.0, 60.0, 60.0]).unwrap();
        let tacs = extract_tacs(&series(3), &labels(), &[1000, 11, 50, 8], &timing, Some(2)).unwrap();

        assert_eq!(tacs.frames.len(), 3);
        let starts: Vec<f64> = tacs.frames.iter().map(|f| f.start_s).collect();
        assert_eq!(starts, [0.0, 60.0, 120.0]);
        // start 0 is volume index 1 → factor 2
        assert_abs_diff_eq!(tacs.frames[0].values[1], 2.0);
        assert_abs_diff_eq!(tacs.frames[0].values[0], 6.0);
        assert_abs_diff_eq!(tacs.frames[2].values[2], 2.0);
        assert_eq!(tacs.voxel_counts, [8, 8, 8, 0]);
        assert!(tacs.frames[0].values[3].is_nan());
    }

    #[test]
    fn frame_count_must_match_metadata() {
        let timing = FrameTiming::new(&[0.0, 60.0], &[60.0, 60.0]).unwrap();
        let err = extract_tacs(&series(3), &labels(), &[11], &timing, None).unwrap_err();
        assert!(matches!(err, PipelineError::FrameCountMismatch { volumes: 3, declared: 2 }));
    }

    #[test]
    fn grids_must_match() {
        let timing = FrameTiming::new(&[0.0], &[60.0]).unwrap();
        let shifted = Volume::from_array(labels().data().to_owned(), Matrix4::identity() * 2.0);
        let err = extract_tacs(&series(1), &shifted, &[11], &timing, None).unwrap_err();
        assert!(matches!(err, PipelineError::GridMismatch { .. }));
    }

    #[test]
    fn csv_is_written_even_when_plots_fail() {
        let dir = tempdir().unwrap();
        let timing = FrameTiming::new(&[0.0, 60.0], &[60.0, 60.0]).unwrap();
        let tacs = extract_tacs(&series(2), &labels(), &[1000, 11], &timing, None).unwrap();
        let regions = [("tumor", tacs.curve(1000).unwrap())];
        let missing = dir.path().join("no-such-dir").join("plot.png");
        let outputs = TacOutputs {
            sub_regions_csv: &dir.path().join("sub.csv"),
            regions_csv: &dir.path().join("tacs.csv"),
            overview_png: Some(&missing),
            sub_regions_png: Some(&dir.path().join("sub.png")),
        };
        write_tacs(&tacs, &regions, &outputs).unwrap();
        assert!(dir.path().join("tacs.csv").exists());
        assert!(dir.path().join("sub.png").exists());
        assert!(!missing.exists());
    }
}
