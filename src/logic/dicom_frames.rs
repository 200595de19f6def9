//! Frame timing recovered from the DICOM files of a dynamic PET series.

use std::collections::BTreeSet;
use std::path::Path;

use dicom::core::Tag;
use dicom_object::{open_file, DefaultDicomObject};
use rayon::prelude::*;

use crate::error::{PipelineError, Result};
use crate::models::frames::FrameTiming;
use crate::utils::discovery::collect_dicom_files;

const FRAME_REFERENCE_TIME: Tag = Tag(0x0054, 0x1300);
const ACTUAL_FRAME_DURATION: Tag = Tag(0x0018, 0x1242);

/// Millisecond values are kept in microseconds so they can be set members.
type FrameKey = (i64, i64);

fn tag_f64(obj: &DefaultDicomObject, tag: Tag) -> Option<f64> {
    obj.element(tag)
        .ok()
        .and_then(|element| element.to_float64().ok())
        .filter(|v| v.is_finite())
}

fn frame_key(path: &Path) -> Option<FrameKey> {
    let obj = match open_file(path) {
        Ok(obj) => obj,
        Err(e) => {
            tracing::warn!(file = %path.display(), error = %e, "skipping unreadable DICOM file");
            return None;
        }
    };
    let reference = tag_f64(&obj, FRAME_REFERENCE_TIME)?;
    let duration = tag_f64(&obj, ACTUAL_FRAME_DURATION)?;
    Some(((reference * 1000.0).round() as i64, (duration * 1000.0).round() as i64))
}

/// Build frame timing from every slice of a series.
///
/// Slices of one frame share `(FrameReferenceTime, ActualFrameDuration)`;
/// frames are taken as contiguous, so each starts where the previous ends.
pub fn frame_timing_from_dicom(dir: &Path) -> Result<FrameTiming> {
    if !dir.is_dir() {
        return Err(PipelineError::Dicom(format!(
            "{} is not a directory",
            dir.display()
        )));
    }
    let files = collect_dicom_files(dir);
    if files.is_empty() {
        return Err(PipelineError::Dicom(format!(
            "no DICOM files found in {}",
            dir.display()
        )));
    }

    let keys: BTreeSet<FrameKey> = files
        .par_iter()
        .fold(BTreeSet::new, |mut acc, path| {
            if let Some(key) = frame_key(path) {
                acc.insert(key);
            }
            acc
        })
        .reduce(BTreeSet::new, |mut acc, part| {
            acc.extend(part);
            acc
        });

    if keys.is_empty() {
        return Err(PipelineError::FrameMetadata(format!(
            "no file in {} carries FrameReferenceTime and ActualFrameDuration",
            dir.display()
        )));
    }
    let (starts, durations) = contiguous_frames(&keys);
    tracing::debug!(frames = starts.len(), dir = %dir.display(), "frame timing read from DICOM");
    FrameTiming::new(&starts, &durations)
}

/// Starts and durations in seconds, ordered by reference time.
fn contiguous_frames(keys: &BTreeSet<FrameKey>) -> (Vec<f64>, Vec<f64>) {
    let mut starts = Vec::with_capacity(keys.len());
    let mut durations = Vec::with_capacity(keys.len());
    let mut t = 0.0;
    for &(_, duration_us) in keys {
        let duration_s = duration_us as f64 / 1e6;
        starts.push(t);
        durations.push(duration_s);
        t += duration_s;
    }
    (starts, durations)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn duplicate_slices_collapse_into_contiguous_frames() {
        let mut keys = BTreeSet::new();
        // two slices per frame, inserted out of order
        for key in [(90_000_000, 60_000_000), (15_000_000, 30_000_000), (90_000_000, 60_000_000), (15_000_000, 30_000_000)] {
            keys.insert(key);
        }
        keys.insert((45_000_000, 30_000_000));
        let (starts, durations) = contiguous_frames(&keys);
        assert_eq!(starts, [0.0, 30.0, 60.0]);
        assert_eq!(durations, [30.0, 30.0, 60.0]);
    }

    #[test]
    fn empty_directory_is_a_dicom_error() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            frame_timing_from_dicom(dir.path()),
            Err(PipelineError::Dicom(_))
        ));
    }
}
