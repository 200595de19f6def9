//! Immutable records produced by the subject stages.

use std::path::PathBuf;

use serde::Serialize;

use crate::error::{PipelineError, Result};
use crate::models::regions::{Hemisphere, RegionLabelSet};
use crate::registration::Alignment;

/// Template → PET transform list, ordered from PET space outward.
#[derive(Debug, Clone, Serialize)]
pub struct TransformChain {
    pub template_to_pet: Vec<PathBuf>,
}

/// Volumes resampled into the PET grid.
#[derive(Debug, Clone, Serialize)]
pub struct PetSpaceVolumes {
    pub brain_mask: PathBuf,
    pub tumor: PathBuf,
    pub atlas: PathBuf,
    pub template: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExcludedRegion {
    pub name: String,
    pub label: i32,
    pub overlap_fraction: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegionSelection {
    pub roi: RegionLabelSet,
    pub reference: RegionLabelSet,
    pub excluded: Vec<ExcludedRegion>,
    pub ipsilateral: Hemisphere,
    /// Some reference candidate overlapped the tumour beyond the threshold.
    pub tumor_overlap: bool,
    /// Share of striatal voxels (both sides) inside the tumour, in percent.
    pub tumor_percentage: f64,
    pub tumor_voxels: usize,
    /// Atlas with distinct left/right ids in PET space.
    pub atlas: PathBuf,
}

/// SUVr-style summary of the static PET.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SuvrSummary {
    pub tumor_mean: f64,
    pub tumor_max: f64,
    pub tumor_volume_ml: f64,
    pub roi_mean: f64,
    pub reference_mean: f64,
    pub tsr_mean: f64,
    pub tsr_max: f64,
    pub roi_ratio: f64,
    pub tumor_overlap: bool,
    pub tumor_percentage: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StaticAnalysis {
    pub summary: SuvrSummary,
    pub tumor_atlas: PathBuf,
    pub striatum_atlas: PathBuf,
    pub values_csv: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TacFrame {
    pub start_s: f64,
    pub duration_s: f64,
    /// Mean uptake per label, in the order of [`TacTable::labels`].
    pub values: Vec<f64>,
}

impl TacFrame {
    pub fn mid_min(&self) -> f64 {
        (self.start_s + self.duration_s / 2.0) / 60.0
    }

    pub fn start_min(&self) -> f64 {
        self.start_s / 60.0
    }
}

/// Per-label time-activity curves, one row per frame sorted by start.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TacTable {
    pub labels: Vec<i32>,
    pub voxel_counts: Vec<usize>,
    pub frames: Vec<TacFrame>,
}

impl TacTable {
    fn column(&self, label: i32) -> Option<usize> {
        self.labels.iter().position(|l| *l == label)
    }

    pub fn curve(&self, label: i32) -> Option<Vec<f64>> {
        let c = self.column(label)?;
        Some(self.frames.iter().map(|f| f.values[c]).collect())
    }

    /// Voxel-weighted mean curve over `labels`.
    pub fn region_curve(&self, name: &str, labels: &[i32]) -> Result<Vec<f64>> {
        let columns: Vec<usize> = labels
            .iter()
            .filter_map(|l| self.column(*l))
            .filter(|c| self.voxel_counts[*c] > 0)
            .collect();
        let total: usize = columns.iter().map(|c| self.voxel_counts[*c]).sum();
        if total == 0 {
            return Err(PipelineError::EmptyRegion(name.to_string()));
        }
        Ok(self
            .frames
            .iter()
            .map(|f| {
                columns
                    .iter()
                    .map(|c| f.values[*c] * self.voxel_counts[*c] as f64)
                    .sum::<f64>()
                    / total as f64
            })
            .collect())
    }

    pub fn mid_times_min(&self) -> Vec<f64> {
        self.frames.iter().map(TacFrame::mid_min).collect()
    }

    pub fn start_times_min(&self) -> Vec<f64> {
        self.frames.iter().map(TacFrame::start_min).collect()
    }
}

/// Reference-region Patlak fit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PatlakFit {
    /// Influx rate relative to the reference region, 1/min.
    pub slope: f64,
    pub intercept: f64,
    pub r_squared: f64,
    pub frames_used: usize,
    pub cutoff_min: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DynamicOutcome {
    /// No dynamic series was acquired for this subject.
    NotAcquired,
    Fitted {
        tacs: TacTable,
        tumor: PatlakFit,
        striatum: PatlakFit,
    },
    /// The dynamic data could not support a fit; static results stay valid.
    Failed { reason: String },
}

impl DynamicOutcome {
    pub fn fitted(&self) -> Option<(&PatlakFit, &PatlakFit)> {
        match self {
            Self::Fitted { tumor, striatum, .. } => Some((tumor, striatum)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SubjectResults {
    pub subject: String,
    pub mri2pet: Alignment,
    pub stx2mri: Alignment,
    pub chain: TransformChain,
    pub pet_space: PetSpaceVolumes,
    pub regions: RegionSelection,
    pub static_analysis: StaticAnalysis,
    pub dynamic: DynamicOutcome,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> TacTable {
        TacTable {
            labels: vec![11, 12, 99],
            voxel_counts: vec![1, 3, 0],
            frames: vec![
                TacFrame { start_s: 0.0, duration_s: 60.0, values: vec![4.0, 8.0, f64::NAN] },
                TacFrame { start_s: 60.0, duration_s: 120.0, values: vec![0.0, 4.0, f64::NAN] },
            ],
        }
    }

    #[test]
    fn region_curve_weights_by_voxel_count_and_skips_empty_labels() {
        let t = table();
        assert_eq!(t.region_curve("striatum", &[11, 12, 99]).unwrap(), [7.0, 3.0]);
        assert!(matches!(
            t.region_curve("ghost", &[99, 5]),
            Err(PipelineError::EmptyRegion(name)) if name == "ghost"
        ));
    }

    #[test]
    fn frame_times_in_minutes() {
        let t = table();
        assert_eq!(t.mid_times_min(), [0.5, 2.0]);
        assert_eq!(t.start_times_min(), [0.0, 1.0]);
        assert_eq!(t.curve(12).unwrap(), [8.0, 4.0]);
        assert!(t.curve(7).is_none());
    }
}
