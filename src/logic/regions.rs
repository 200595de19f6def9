//! Striatal ROI and reference-region selection in PET space.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use nalgebra::{Point3, Vector3};
use ndarray::{Array3, Zip};

use crate::error::{PipelineError, Result};
use crate::models::regions::{AtlasConvention, Hemisphere, HemisphereLayout, RegionLabelSet};
use crate::models::results::{ExcludedRegion, RegionSelection};
use crate::volume::{Grid, Volume};

/// Tumour probability above which a voxel belongs to the tumour.
const TUMOR_THRESHOLD: f32 = 0.5;

#[derive(Debug, Clone, Copy, Default)]
struct LabelStats {
    voxels: usize,
    tumor_voxels: usize,
    world_sum: Vector3<f64>,
}

impl LabelStats {
    fn overlap_fraction(&self) -> f64 {
        if self.voxels == 0 {
            0.0
        } else {
            self.tumor_voxels as f64 / self.voxels as f64
        }
    }
}

/// Outcome of region selection, with the volumes later stages read.
#[derive(Debug, Clone)]
pub struct RegionDecision {
    pub roi: RegionLabelSet,
    pub reference: RegionLabelSet,
    pub excluded: Vec<ExcludedRegion>,
    pub ipsilateral: Hemisphere,
    pub tumor_overlap: bool,
    pub tumor_percentage: f64,
    /// Lateralized atlas on the PET grid.
    pub atlas: Volume,
    pub tumor_mask: Array3<bool>,
}

impl RegionDecision {
    pub fn tumor_voxels(&self) -> usize {
        self.tumor_mask.iter().filter(|v| **v).count()
    }

    pub fn record(&self, atlas_path: PathBuf) -> RegionSelection {
        RegionSelection {
            roi: self.roi.clone(),
            reference: self.reference.clone(),
            excluded: self.excluded.clone(),
            ipsilateral: self.ipsilateral,
            tumor_overlap: self.tumor_overlap,
            tumor_percentage: self.tumor_percentage,
            tumor_voxels: self.tumor_voxels(),
            atlas: atlas_path,
        }
    }
}

pub struct RegionSelector<'a> {
    convention: &'a AtlasConvention,
    overlap_threshold: f64,
}

impl<'a> RegionSelector<'a> {
    pub fn new(convention: &'a AtlasConvention, overlap_threshold: f64) -> Self {
        Self {
            convention,
            overlap_threshold,
        }
    }

    /// Select ROI and reference labels for one subject.
    ///
    /// `atlas`, `tumor` and `brain` must share the PET grid.
    pub fn select(
        &self,
        atlas: &Volume,
        tumor: &Volume,
        brain: &Volume,
        tumor_path: &Path,
    ) -> Result<RegionDecision> {
        let grid = atlas.grid();
        grid.ensure_same(&tumor.grid())?;
        grid.ensure_same(&brain.grid())?;

        let atlas = match self.convention.layout {
            HemisphereLayout::Lateralized => atlas.clone(),
            HemisphereLayout::Bilateral { right_offset } => {
                mirror(atlas, &self.convention.mirrored_labels(), right_offset)?
            }
        };
        let convention = self.convention.lateralized();

        let mut tumor_mask = Array3::from_elem(grid.shape, false);
        Zip::from(&mut tumor_mask)
            .and(&tumor.data())
            .and(&brain.data())
            .for_each(|m, &t, &b| *m = t > TUMOR_THRESHOLD && b > 0.0);

        let stats = label_stats(&atlas, &tumor_mask, &grid);
        let present = |label: i32| stats.get(&label).is_some_and(|s| s.voxels > 0);

        let missing: Vec<i32> = convention
            .striatal_labels()
            .into_iter()
            .filter(|l| !present(*l))
            .collect();
        if !missing.is_empty() {
            return Err(PipelineError::AtlasConvention {
                region: "striatum".into(),
                missing,
            });
        }

        let tumor_centroid = mask_centroid(&tumor_mask, &grid)
            .ok_or_else(|| PipelineError::EmptyTumor(tumor_path.to_path_buf()))?;

        let side_centroid = |side: Hemisphere| {
            let (sum, n) = convention.structures.iter().fold(
                (Vector3::zeros(), 0usize),
                |(sum, n), s| {
                    let st = stats[&s.label(side)];
                    (sum + st.world_sum, n + st.voxels)
                },
            );
            Point3::from(sum / n as f64)
        };
        let left = nalgebra::distance(&side_centroid(Hemisphere::Left), &tumor_centroid);
        let right = nalgebra::distance(&side_centroid(Hemisphere::Right), &tumor_centroid);
        let ipsilateral = if left <= right {
            Hemisphere::Left
        } else {
            Hemisphere::Right
        };
        let contralateral = ipsilateral.opposite();

        let mut roi = RegionLabelSet::empty("striatum");
        for s in &convention.structures {
            roi.insert(s.label(ipsilateral));
        }

        let mut reference = RegionLabelSet::empty("reference");
        let mut excluded = Vec::new();
        for s in &convention.structures {
            let label = s.label(contralateral);
            let fraction = stats[&label].overlap_fraction();
            if fraction > self.overlap_threshold {
                tracing::info!(
                    region = %s.name,
                    label,
                    overlap = fraction,
                    "excluding reference candidate overlapping the tumor"
                );
                excluded.push(ExcludedRegion {
                    name: s.name.clone(),
                    label,
                    overlap_fraction: fraction,
                });
            } else {
                reference.insert(label);
            }
        }
        let tumor_overlap = !excluded.is_empty();

        if reference.is_empty() {
            let fallback: Vec<i32> = convention
                .fallback_reference
                .iter()
                .copied()
                .filter(|l| present(*l) && !roi.contains(*l))
                .filter(|l| stats[l].overlap_fraction() <= self.overlap_threshold)
                .collect();
            if fallback.is_empty() {
                return Err(PipelineError::AtlasConvention {
                    region: "fallback reference".into(),
                    missing: convention.fallback_reference.clone(),
                });
            }
            tracing::warn!(?fallback, "all striatal reference candidates excluded, using fallback");
            reference = RegionLabelSet::new("reference (fallback)", &fallback)?;
        }

        let (striatal, touched) = convention
            .striatal_labels()
            .iter()
            .map(|l| stats[l])
            .fold((0usize, 0usize), |(n, t), s| (n + s.voxels, t + s.tumor_voxels));
        let tumor_percentage = 100.0 * touched as f64 / striatal as f64;

        Ok(RegionDecision {
            roi,
            reference,
            excluded,
            ipsilateral,
            tumor_overlap,
            tumor_percentage,
            atlas,
            tumor_mask,
        })
    }
}

/// Per-label voxel counts, tumour overlap and world-coordinate sums.
fn label_stats(atlas: &Volume, tumor: &Array3<bool>, grid: &Grid) -> HashMap<i32, LabelStats> {
    let mut stats: HashMap<i32, LabelStats> = HashMap::new();
    Zip::indexed(&atlas.data())
        .and(tumor)
        .for_each(|(i, j, k), &v, &in_tumor| {
            let label = v.round() as i32;
            if label == 0 {
                return;
            }
            let p = grid.voxel_to_world((i as f64, j as f64, k as f64));
            let entry = stats.entry(label).or_default();
            entry.voxels += 1;
            entry.tumor_voxels += usize::from(in_tumor);
            entry.world_sum += p.coords;
        });
    stats
}

fn mask_centroid(mask: &Array3<bool>, grid: &Grid) -> Option<Point3<f64>> {
    let mut sum = Vector3::zeros();
    let mut n = 0usize;
    for ((i, j, k), &inside) in mask.indexed_iter() {
        if inside {
            sum += grid.voxel_to_world((i as f64, j as f64, k as f64)).coords;
            n += 1;
        }
    }
    (n > 0).then(|| Point3::from(sum / n as f64))
}

/// Give `labels` right of the midline the id `label + right_offset`.
///
/// The midline is the world-x of the centroid of all non-zero atlas voxels.
pub fn mirror(atlas: &Volume, labels: &[i32], right_offset: i32) -> Result<Volume> {
    let grid = atlas.grid();
    let data = atlas.data();
    let nonzero = data.mapv(|v| v.round() != 0.0);
    let midline = mask_centroid(&nonzero, &grid)
        .ok_or_else(|| PipelineError::AtlasConvention {
            region: "atlas".into(),
            missing: labels.to_vec(),
        })?
        .x;

    let mut out = data.to_owned();
    Zip::indexed(&mut out).for_each(|(i, j, k), v| {
        let label = v.round() as i32;
        if labels.contains(&label) && grid.voxel_to_world((i as f64, j as f64, k as f64)).x > midline {
            *v = (label + right_offset) as f32;
        }
    });
    atlas.with_data(out)
}
