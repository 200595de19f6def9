//! Frame timing of a dynamic PET series.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

/// One acquisition frame; `index` is its position in the 4-D volume.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Frame {
    pub index: usize,
    pub start_s: f64,
    pub duration_s: f64,
}

impl Frame {
    pub fn mid_s(&self) -> f64 {
        self.start_s + self.duration_s / 2.0
    }

    pub fn end_s(&self) -> f64 {
        self.start_s + self.duration_s
    }
}

/// BIDS PET sidecar keys.
#[derive(Debug, Deserialize)]
struct Sidecar {
    #[serde(rename = "FrameTimesStart")]
    starts: Vec<f64>,
    #[serde(rename = "FrameDuration")]
    durations: Vec<f64>,
}

/// Frames sorted by start time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FrameTiming {
    frames: Vec<Frame>,
}

impl FrameTiming {
    /// `starts` and `durations` are in seconds and in volume order.
    pub fn new(starts: &[f64], durations: &[f64]) -> Result<Self> {
        if starts.len() != durations.len() {
            return Err(PipelineError::FrameMetadata(format!(
                "{} frame start times but {} durations",
                starts.len(),
                durations.len()
            )));
        }
        if starts.is_empty() {
            return Err(PipelineError::FrameMetadata("no frames declared".into()));
        }
        let mut frames = Vec::with_capacity(starts.len());
        for (index, (&start_s, &duration_s)) in starts.iter().zip(durations).enumerate() {
            if !start_s.is_finite() || !duration_s.is_finite() || duration_s <= 0.0 {
                return Err(PipelineError::FrameMetadata(format!(
                    "frame {index} has start {start_s} s and duration {duration_s} s"
                )));
            }
            frames.push(Frame {
                index,
                start_s,
                duration_s,
            });
        }
        frames.sort_by(|a, b| a.start_s.total_cmp(&b.start_s));
        Ok(Self { frames })
    }

    /// Read `FrameTimesStart` / `FrameDuration` from a JSON sidecar.
    pub fn from_json(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let sidecar: Sidecar = serde_json::from_str(&text).map_err(|e| {
            PipelineError::FrameMetadata(format!("{}: {e}", path.display()))
        })?;
        Self::new(&sidecar.starts, &sidecar.durations)
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    /// Frame durations in volume order, for a duration-weighted average.
    pub fn weights(&self) -> Vec<f64> {
        let mut w = vec![0.0; self.frames.len()];
        for f in &self.frames {
            w[f.index] = f.duration_s;
        }
        w
    }

    pub fn ensure_volume_count(&self, volumes: usize) -> Result<()> {
        if volumes != self.frames.len() {
            return Err(PipelineError::FrameCountMismatch {
                volumes,
                declared: self.frames.len(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn frames_are_sorted_by_start_and_keep_volume_index() {
        let timing = FrameTiming::new(&[60.0, 0.0, 120.0], &[60.0, 60.0, 300.0]).unwrap();
        let starts: Vec<f64> = timing.frames().iter().map(|f| f.start_s).collect();
        assert_eq!(starts, [0.0, 60.0, 120.0]);
        assert_eq!(timing.frames()[0].index, 1);
        assert_eq!(timing.weights(), [60.0, 60.0, 300.0]);
        assert_eq!(timing.frames()[2].mid_s(), 270.0);
    }

    #[test]
    fn sidecar_is_parsed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pet.json");
        fs::write(
            &path,
            r#"{"FrameTimesStart": [0, 30, 90], "FrameDuration": [30, 60, 120], "Units": "Bq/mL"}"#,
        )
        .unwrap();
        let timing = FrameTiming::from_json(&path).unwrap();
        assert_eq!(timing.len(), 3);
        assert!(timing.ensure_volume_count(3).is_ok());
        assert!(matches!(
            timing.ensure_volume_count(4),
            Err(PipelineError::FrameCountMismatch { volumes: 4, declared: 3 })
        ));
    }

    #[test]
    fn missing_keys_and_bad_durations_are_frame_metadata_errors() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pet.json");
        fs::write(&path, r#"{"FrameDuration": [30]}"#).unwrap();
        assert!(matches!(FrameTiming::from_json(&path), Err(PipelineError::FrameMetadata(_))));
        assert!(FrameTiming::new(&[0.0], &[0.0]).is_err());
        assert!(FrameTiming::new(&[0.0, 1.0], &[1.0]).is_err());
    }
}
