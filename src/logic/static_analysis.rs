//! Tumour and striatum atlases and the static SUVr summary.

use std::path::Path;

use ndarray::Zip;

use crate::error::{PipelineError, Result};
use crate::logic::regions::RegionDecision;
use crate::models::results::{StaticAnalysis, SuvrSummary};
use crate::utils::tables;
use crate::volume::Volume;

#[derive(Debug, Default, Clone, Copy)]
struct Accumulator {
    sum: f64,
    max: f64,
    n: usize,
}

impl Accumulator {
    fn add(&mut self, v: f64) {
        self.max = if self.n == 0 { v } else { self.max.max(v) };
        self.sum += v;
        self.n += 1;
    }

    fn mean(&self, region: &str) -> Result<f64> {
        if self.n == 0 {
            return Err(PipelineError::EmptyRegion(region.to_string()));
        }
        Ok(self.sum / self.n as f64)
    }
}

/// Lateralized atlas with tumour voxels relabelled to `tumor_label`.
pub fn tumor_atlas(decision: &RegionDecision, tumor_label: i32) -> Result<Volume> {
    if decision.atlas.distinct_labels().contains(&tumor_label) {
        return Err(PipelineError::Config(format!(
            "tumor label {tumor_label} is already used by the atlas"
        )));
    }
    let mut data = decision.atlas.data().to_owned();
    Zip::from(&mut data)
        .and(&decision.tumor_mask)
        .for_each(|v, &in_tumor| {
            if in_tumor {
                *v = tumor_label as f32;
            }
        });
    decision.atlas.with_data(data)
}

/// Atlas restricted to the ROI and reference labels.
pub fn striatum_atlas(decision: &RegionDecision) -> Result<Volume> {
    let keep = |v: f32| {
        let label = v.round() as i32;
        decision.roi.contains(label) || decision.reference.contains(label)
    };
    let data = decision.atlas.data().mapv(|v| if keep(v) { v } else { 0.0 });
    decision.atlas.with_data(data)
}

/// Tumour, ROI and reference uptake of the static PET.
///
/// Voxels are assigned through the tumour atlas, so tumour voxels never count
/// towards the striatal regions.
pub fn summarize(
    pet: &Volume,
    tumor_atlas: &Volume,
    decision: &RegionDecision,
    tumor_label: i32,
) -> Result<SuvrSummary> {
    let grid = tumor_atlas.grid();
    grid.ensure_same(&pet.grid())?;

    let (mut tumor, mut roi, mut reference) = (
        Accumulator::default(),
        Accumulator::default(),
        Accumulator::default(),
    );
    Zip::from(&pet.data())
        .and(&tumor_atlas.data())
        .for_each(|&v, &l| {
            let label = l.round() as i32;
            let v = v as f64;
            if label == tumor_label {
                tumor.add(v);
            } else if decision.roi.contains(label) {
                roi.add(v);
            } else if decision.reference.contains(label) {
                reference.add(v);
            }
        });

    let tumor_mean = tumor.mean("tumor")?;
    let roi_mean = roi.mean(&decision.roi.name)?;
    let reference_mean = reference.mean(&decision.reference.name)?;

    Ok(SuvrSummary {
        tumor_mean,
        tumor_max: tumor.max,
        tumor_volume_ml: tumor.n as f64 * grid.voxel_volume() / 1000.0,
        roi_mean,
        reference_mean,
        tsr_mean: tumor_mean / reference_mean,
        tsr_max: tumor.max / reference_mean,
        roi_ratio: roi_mean / reference_mean,
        tumor_overlap: decision.tumor_overlap,
        tumor_percentage: decision.tumor_percentage,
    })
}

pub struct StaticOutputs<'a> {
    pub tumor_atlas: &'a Path,
    pub striatum_atlas: &'a Path,
    pub values_csv: &'a Path,
}

/// Build both refined atlases, summarize the static PET and write the values table.
pub fn analyse(
    subject: &str,
    pet: &Volume,
    decision: &RegionDecision,
    tumor_label: i32,
    outputs: &StaticOutputs<'_>,
) -> Result<StaticAnalysis> {
    let tumor = tumor_atlas(decision, tumor_label)?;
    tumor.save(outputs.tumor_atlas)?;
    striatum_atlas(decision)?.save(outputs.striatum_atlas)?;

    let summary = summarize(pet, &tumor, decision, tumor_label)?;
    tables::write_values(outputs.values_csv, subject, &summary)?;
    tracing::info!(
        subject,
        tsr_mean = summary.tsr_mean,
        roi_ratio = summary.roi_ratio,
        "static analysis done"
    );

    Ok(StaticAnalysis {
        summary,
        tumor_atlas: outputs.tumor_atlas.to_path_buf(),
        striatum_atlas: outputs.striatum_atlas.to_path_buf(),
        values_csv: outputs.values_csv.to_path_buf(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::regions::{Hemisphere, RegionLabelSet};
    use approx::assert_abs_diff_eq;
    use nalgebra::Matrix4;
    use ndarray::Array3;

    fn affine() -> Matrix4<f64> {
        let mut m = Matrix4::identity() * 2.0;
        m[(3, 3)] = 1.0;
        m
    }

    fn decision() -> RegionDecision {
        // i=0: caudate L (11), i=1: caudate R (50), i=2: tumour inside 11's column, i=3: other
        let atlas = Array3::from_shape_fn((4, 2, 1), |(i, _, _)| match i {
            0 | 2 => 11.0,
            1 => 50.0,
            _ => 3.0,
        });
        let mut tumor_mask = Array3::from_elem((4, 2, 1), false);
        tumor_mask[(2, 0, 0)] = true;
        tumor_mask[(2, 1, 0)] = true;
        RegionDecision {
            roi: RegionLabelSet::new("striatum", &[11]).unwrap(),
            reference: RegionLabelSet::new("reference", &[50]).unwrap(),
            excluded: Vec::new(),
            ipsilateral: Hemisphere::Left,
            tumor_overlap: false,
            tumor_percentage: 50.0,
            atlas: Volume::from_array(atlas, affine()),
            tumor_mask,
        }
    }

    fn pet() -> Volume {
        let data = Array3::from_shape_fn((4, 2, 1), |(i, j, _)| match i {
            0 => 4.0,
            1 => 2.0,
            2 => 6.0 + j as f32 * 2.0,
            _ => 100.0,
        });
        Volume::from_array(data, affine())
    }

    #[test]
    fn summary_ratios_use_the_reference_mean() {
        let d = decision();
        let tumor = tumor_atlas(&d, 1000).unwrap();
        assert_eq!(tumor.label_at((2, 0, 0)), 1000);
        assert_eq!(tumor.label_at((0, 0, 0)), 11);

        let s = summarize(&pet(), &tumor, &d, 1000).unwrap();
        assert_abs_diff_eq!(s.tumor_mean, 7.0);
        assert_abs_diff_eq!(s.tumor_max, 8.0);
        assert_abs_diff_eq!(s.roi_mean, 4.0);
        assert_abs_diff_eq!(s.reference_mean, 2.0);
        assert_abs_diff_eq!(s.tsr_mean, 3.5);
        assert_abs_diff_eq!(s.tsr_max, 4.0);
        assert_abs_diff_eq!(s.roi_ratio, 2.0);
        assert_abs_diff_eq!(s.tumor_volume_ml, 2.0 * 8.0 / 1000.0);

        let striatum = striatum_atlas(&d).unwrap();
        assert_eq!(striatum.distinct_labels(), [0, 11, 50]);
    }

    #[test]
    fn empty_reference_region_is_reported() {
        let mut d = decision();
        d.reference = RegionLabelSet::new("reference", &[47]).unwrap();
        let tumor = tumor_atlas(&d, 1000).unwrap();
        assert!(matches!(
            summarize(&pet(), &tumor, &d, 1000),
            Err(PipelineError::EmptyRegion(name)) if name == "reference"
        ));
    }

    #[test]
    fn tumor_label_already_in_atlas_is_rejected() {
        let d = decision();
        assert!(tumor_atlas(&d, 50).is_err());
    }
}
