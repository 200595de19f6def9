//! One subject through the whole pipeline.
//!
//! Stages run in a fixed order and each returns an immutable record; the
//! dynamic branch runs only when a 4-D series was given.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{PipelineError, Result};
use crate::logic::dicom_frames::frame_timing_from_dicom;
use crate::logic::kinetics::{fit_patlak, plot_regression, PatlakResult};
use crate::logic::regions::{RegionDecision, RegionSelector};
use crate::logic::static_analysis::{self, StaticOutputs};
use crate::logic::tacs::{extract_tacs, write_tacs, TacOutputs};
use crate::models::config::{subject_id, PipelineSettings, SubjectFiles};
use crate::models::frames::FrameTiming;
use crate::models::regions::HemisphereLayout;
use crate::models::results::{
    DynamicOutcome, PetSpaceVolumes, RegionSelection, SubjectResults, TransformChain,
};
use crate::progress::{ProgressSink, ProgressSpan, Stage, StageTracker};
use crate::registration::{align, transform, RegistrationBackend, TransformMethod};
use crate::resample::Interpolator;
use crate::volume::{Volume, Volume4};

/// Every directory and file name a subject writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubjectLayout {
    pub root: PathBuf,
    pub qc: PathBuf,
    pub coregistration: PathBuf,
    pub refinement: PathBuf,
    pub data: PathBuf,
    name: String,
}

impl SubjectLayout {
    /// Layout of `sub-<id>` under `out_dir`. Nothing is created.
    pub fn new(out_dir: &Path, name: &str) -> Self {
        let root = out_dir.join(name);
        Self {
            qc: root.join("qc"),
            coregistration: root.join("coregistration"),
            refinement: root.join("refinement"),
            data: root.join("data"),
            root,
            name: name.to_string(),
        }
    }

    pub fn create_dirs(&self) -> Result<()> {
        for dir in [&self.root, &self.qc, &self.coregistration, &self.refinement, &self.data] {
            fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    fn named(&self, dir: &Path, suffix: &str) -> PathBuf {
        dir.join(format!("{}_{suffix}", self.name))
    }

    pub fn mri2pet_prefix(&self) -> PathBuf {
        self.named(&self.coregistration, "mri2pet_Rigid_")
    }

    pub fn stx2mri_prefix(&self) -> PathBuf {
        self.named(&self.coregistration, "stx2mri_SyN_")
    }

    /// Prefix of every volume resampled into PET space.
    pub fn pet_space_prefix(&self) -> PathBuf {
        self.named(&self.coregistration, "pet_space_")
    }

    pub fn lateralized_atlas(&self) -> PathBuf {
        self.named(&self.refinement, "atlas_lateralized.nii.gz")
    }

    pub fn tumor_atlas(&self) -> PathBuf {
        self.named(&self.refinement, "tumor_atlas.nii.gz")
    }

    pub fn striatum_atlas(&self) -> PathBuf {
        self.named(&self.refinement, "striatum_atlas.nii.gz")
    }

    pub fn static_pet(&self) -> PathBuf {
        self.named(&self.data, "pet3d.nii.gz")
    }

    pub fn values_csv(&self) -> PathBuf {
        self.named(&self.root, "values.csv")
    }

    pub fn tacs_csv(&self) -> PathBuf {
        self.named(&self.root, "TACs.csv")
    }

    pub fn tac_sub_regions_csv(&self) -> PathBuf {
        self.named(&self.root, "TACs_sub_regions.csv")
    }

    /// `qc/sub-<id>_<suffix>`.
    pub fn qc_file(&self, suffix: &str) -> PathBuf {
        self.named(&self.qc, suffix)
    }
}

/// Where the frame timing of the 4-D series comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
enum FrameSource {
    Json(PathBuf),
    Dicom(PathBuf),
}

pub struct Subject<'a> {
    name: String,
    files: SubjectFiles,
    settings: &'a PipelineSettings,
    layout: SubjectLayout,
    span: ProgressSpan,
    frame_source: Option<FrameSource>,
    has_dynamic_series: bool,
}

impl<'a> Subject<'a> {
    /// Resolve the inputs of `key` against `work_dir` and create its output tree.
    pub fn new(
        key: &str,
        files: &SubjectFiles,
        work_dir: &Path,
        out_dir: &Path,
        settings: &'a PipelineSettings,
        span: ProgressSpan,
    ) -> Result<Self> {
        let name = format!("sub-{}", subject_id(key));
        let files = files.resolve(work_dir);
        if files.pet.is_none() && files.pet4d.is_none() {
            return Err(PipelineError::Config(format!(
                "{name} lists neither `pet` nor `pet4d`"
            )));
        }
        let frame_source = match (&files.pet4d_json, &files.pet4d_dicom) {
            (Some(json), _) => Some(FrameSource::Json(json.clone())),
            (None, Some(dir)) => Some(FrameSource::Dicom(dir.clone())),
            (None, None) => None,
        };

        let layout = SubjectLayout::new(out_dir, &name);
        layout.create_dirs()?;

        Ok(Self {
            has_dynamic_series: files.has_dynamic_series(),
            name,
            files,
            settings,
            layout,
            span,
            frame_source,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn layout(&self) -> &SubjectLayout {
        &self.layout
    }

    pub fn has_dynamic_series(&self) -> bool {
        self.has_dynamic_series
    }

    fn qc(&self, suffix: &str) -> Option<PathBuf> {
        self.settings.qc.then(|| self.layout.qc_file(suffix))
    }

    fn frame_timing(&self) -> Result<FrameTiming> {
        match &self.frame_source {
            Some(FrameSource::Json(path)) => FrameTiming::from_json(path),
            Some(FrameSource::Dicom(dir)) => frame_timing_from_dicom(dir),
            None => Err(PipelineError::FrameMetadata(format!(
                "{} has a 4-D series but neither `pet4d_json` nor `pet4d_dicom`",
                self.name
            ))),
        }
    }

    fn dynamic_series(&self) -> Result<&Path> {
        self.files.pet4d.as_deref().ok_or_else(|| {
            PipelineError::Config(format!("{} has no 4-D series", self.name))
        })
    }

    /// The static PET, averaging the 4-D series when none was given.
    fn static_pet(&self) -> Result<PathBuf> {
        if let Some(pet) = &self.files.pet {
            return Ok(pet.clone());
        }
        let output = self.layout.static_pet();
        if output.exists() && !self.settings.clobber {
            tracing::debug!(output = %output.display(), "static PET exists, reusing");
            return Ok(output);
        }
        let timing = self.frame_timing()?;
        let series = Volume4::open(self.dynamic_series()?)?;
        timing.ensure_volume_count(series.n_frames())?;
        series.weighted_mean(&timing.weights())?.save(&output)?;
        tracing::info!(subject = %self.name, output = %output.display(), "static PET averaged from frames");
        Ok(output)
    }

    /// Run every stage and report progress over this subject's span.
    pub fn process(
        &self,
        backend: &dyn RegistrationBackend,
        sink: &dyn ProgressSink,
    ) -> Result<SubjectResults> {
        let settings = self.settings;
        let clobber = settings.clobber;
        let mut tracker = StageTracker::new(sink, self.span, Stage::count(self.has_dynamic_series));

        let pet = self.static_pet()?;

        let mri2pet = align(
            backend,
            &pet,
            &self.files.mri,
            TransformMethod::Rigid,
            &self.layout.mri2pet_prefix(),
            self.qc("mri2pet.gif").as_deref(),
            clobber,
        )?;
        tracker.complete(Stage::Mri2PetAligned);

        let stx2mri = align(
            backend,
            &self.files.mri,
            &settings.template,
            TransformMethod::SyNAggro,
            &self.layout.stx2mri_prefix(),
            self.qc("stx2mri.gif").as_deref(),
            clobber,
        )?;
        tracker.complete(Stage::Template2MriAligned);

        let chain = TransformChain {
            template_to_pet: vec![mri2pet.forward.clone(), stx2mri.forward.clone()],
        };
        tracker.complete(Stage::TransformComposed);

        let prefix = self.layout.pet_space_prefix();
        let mri_to_pet = [mri2pet.forward.clone()];
        let to_pet = |moving: &Path, transforms: &[PathBuf], interpolator, qc: &str| {
            transform(
                backend,
                &prefix,
                &pet,
                moving,
                transforms,
                interpolator,
                self.qc(qc).as_deref(),
                clobber,
            )
        };

        let brain_mask = to_pet(&self.files.mri_str, &mri_to_pet, Interpolator::Linear, "pet_brain.gif")?;
        tracker.complete(Stage::BrainMaskResampled);
        let tumor = to_pet(&self.files.tumor_mri, &mri_to_pet, Interpolator::NearestNeighbor, "volume_MRI.gif")?;
        tracker.complete(Stage::TumorResampled);
        let atlas = to_pet(
            &settings.atlas,
            &chain.template_to_pet,
            Interpolator::NearestNeighbor,
            "atlas_pet_space.gif",
        )?;
        tracker.complete(Stage::AtlasResampled);
        let template = to_pet(
            &settings.template,
            &chain.template_to_pet,
            Interpolator::Linear,
            "template_pet_space.gif",
        )?;
        tracker.complete(Stage::TemplateResampled);
        let pet_space = PetSpaceVolumes {
            brain_mask,
            tumor,
            atlas,
            template,
        };

        let (decision, regions) = self.select_regions(&pet_space)?;
        sink.log_message(&format!(
            "{}: ROI {} ({} side), reference {}",
            self.name, decision.roi, decision.ipsilateral, decision.reference
        ));
        tracker.complete(Stage::RegionsSelected);

        let pet_volume = Volume::open(&pet)?;
        let (tumor_atlas, striatum_atlas, values_csv) = (
            self.layout.tumor_atlas(),
            self.layout.striatum_atlas(),
            self.layout.values_csv(),
        );
        let static_analysis = static_analysis::analyse(
            &self.name,
            &pet_volume,
            &decision,
            settings.tumor_label,
            &StaticOutputs {
                tumor_atlas: &tumor_atlas,
                striatum_atlas: &striatum_atlas,
                values_csv: &values_csv,
            },
        )?;
        tracker.complete(Stage::StaticAnalysisDefined);

        let dynamic = if self.has_dynamic_series {
            match self.dynamic_branch(&decision, &mut tracker) {
                Ok(outcome) => outcome,
                Err(e) if e.is_dynamic_only() => {
                    sink.log_error(&format!("{}: dynamic analysis skipped: {e}", self.name));
                    DynamicOutcome::Failed {
                        reason: e.to_string(),
                    }
                }
                Err(e) => return Err(e),
            }
        } else {
            DynamicOutcome::NotAcquired
        };
        tracker.finish();

        Ok(SubjectResults {
            subject: self.name.clone(),
            mri2pet,
            stx2mri,
            chain,
            pet_space,
            regions,
            static_analysis,
            dynamic,
        })
    }

    fn select_regions(&self, pet_space: &PetSpaceVolumes) -> Result<(RegionDecision, RegionSelection)> {
        let selector = RegionSelector::new(&self.settings.convention, self.settings.overlap_threshold);
        let decision = selector.select(
            &Volume::open(&pet_space.atlas)?,
            &Volume::open(&pet_space.tumor)?,
            &Volume::open(&pet_space.brain_mask)?,
            &pet_space.tumor,
        )?;
        let atlas = match self.settings.convention.layout {
            HemisphereLayout::Lateralized => pet_space.atlas.clone(),
            HemisphereLayout::Bilateral { .. } => {
                let path = self.layout.lateralized_atlas();
                decision.atlas.save(&path)?;
                path
            }
        };
        let record = decision.record(atlas);
        Ok((decision, record))
    }

    fn dynamic_branch(
        &self,
        decision: &RegionDecision,
        tracker: &mut StageTracker<'_>,
    ) -> Result<DynamicOutcome> {
        let settings = self.settings;
        let timing = self.frame_timing()?;
        let series = Volume4::open(self.dynamic_series()?)?;
        timing.ensure_volume_count(series.n_frames())?;

        let tumor_label = settings.tumor_label;
        let label_volume = static_analysis::tumor_atlas(decision, tumor_label)?;
        let labels: Vec<i32> = std::iter::once(tumor_label)
            .chain(decision.roi.labels().iter().copied())
            .chain(decision.reference.labels().iter().copied())
            .collect();
        let tacs = extract_tacs(&series, &label_volume, &labels, &timing, settings.threads)?;

        let regions = [
            ("tumor", tacs.region_curve("tumor", &[tumor_label])?),
            ("roi", tacs.region_curve(&decision.roi.name, decision.roi.labels())?),
            (
                "reference",
                tacs.region_curve(&decision.reference.name, decision.reference.labels())?,
            ),
        ];
        let (sub_regions_csv, regions_csv) = (self.layout.tac_sub_regions_csv(), self.layout.tacs_csv());
        let (overview_png, sub_regions_png) = (self.qc("TACs.png"), self.qc("TAC_sub_regions.png"));
        write_tacs(
            &tacs,
            &regions,
            &TacOutputs {
                sub_regions_csv: &sub_regions_csv,
                regions_csv: &regions_csv,
                overview_png: overview_png.as_deref(),
                sub_regions_png: sub_regions_png.as_deref(),
            },
        )?;
        tracker.complete(Stage::TacExtracted);

        let reference = (decision.reference.name.as_str(), decision.reference.labels());
        let cutoff = settings.equilibrium_cutoff_min;
        let tumor = fit_patlak(&tacs, ("tumor", &[tumor_label]), reference, cutoff)?;
        let striatum = fit_patlak(
            &tacs,
            (decision.roi.name.as_str(), decision.roi.labels()),
            reference,
            cutoff,
        )?;
        self.plot_fit(&tumor, "regline_tumor.png");
        self.plot_fit(&striatum, "regline_striatum.png");
        tracing::info!(
            subject = %self.name,
            tumor_slope = tumor.fit.slope,
            striatum_slope = striatum.fit.slope,
            "dynamic parameters fit"
        );
        tracker.complete(Stage::DynamicParametersFit);

        Ok(DynamicOutcome::Fitted {
            tacs,
            tumor: tumor.fit,
            striatum: striatum.fit,
        })
    }

    fn plot_fit(&self, result: &PatlakResult, suffix: &str) {
        let Some(path) = self.qc(suffix) else {
            return;
        };
        if let Err(e) = plot_regression(result, &path) {
            tracing::warn!(plot = %path.display(), error = %e, "could not write regression plot");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn files() -> SubjectFiles {
        SubjectFiles {
            tumor_mri: "t.nii.gz".into(),
            pet: Some("p.nii.gz".into()),
            pet4d: None,
            pet4d_json: None,
            pet4d_dicom: None,
            mri: "m.nii.gz".into(),
            mri_str: "ms.nii.gz".into(),
        }
    }

    #[test]
    fn layout_names_follow_the_subject() {
        let layout = SubjectLayout::new(Path::new("/out"), "sub-007");
        assert_eq!(
            layout.mri2pet_prefix(),
            PathBuf::from("/out/sub-007/coregistration/sub-007_mri2pet_Rigid_")
        );
        assert_eq!(
            layout.qc_file("TACs.png"),
            PathBuf::from("/out/sub-007/qc/sub-007_TACs.png")
        );
        assert_eq!(
            layout.static_pet(),
            PathBuf::from("/out/sub-007/data/sub-007_pet3d.nii.gz")
        );
    }

    #[test]
    fn construction_creates_the_output_tree() {
        let dir = tempdir().unwrap();
        let settings = PipelineSettings::new("tpl.nii.gz".into(), "atlas.nii.gz".into());
        let subject = Subject::new(
            "007",
            &files(),
            dir.path(),
            &dir.path().join("out"),
            &settings,
            ProgressSpan::new(10, 90),
        )
        .unwrap();

        assert_eq!(subject.name(), "sub-007");
        assert!(!subject.has_dynamic_series());
        for sub in ["qc", "coregistration", "refinement", "data"] {
            assert!(dir.path().join("out/sub-007").join(sub).is_dir());
        }
    }

    #[test]
    fn subject_without_any_pet_is_rejected() {
        let dir = tempdir().unwrap();
        let settings = PipelineSettings::new("tpl.nii.gz".into(), "atlas.nii.gz".into());
        let mut files = files();
        files.pet = None;
        let err = Subject::new("sub-1", &files, dir.path(), dir.path(), &settings, ProgressSpan::new(0, 100))
            .err()
            .unwrap();
        assert!(matches!(err, PipelineError::Config(_)));
    }

    #[test]
    fn dynamic_series_without_timing_is_a_frame_metadata_error() {
        let dir = tempdir().unwrap();
        let settings = PipelineSettings::new("tpl.nii.gz".into(), "atlas.nii.gz".into());
        let mut files = files();
        files.pet4d = Some("p4.nii.gz".into());
        let subject = Subject::new("sub-1", &files, dir.path(), dir.path(), &settings, ProgressSpan::new(0, 100))
            .unwrap();
        assert!(subject.has_dynamic_series());
        let err = subject.frame_timing().unwrap_err();
        assert!(err.is_dynamic_only());
    }
}
