use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::models::regions::AtlasConvention;

pub const DEFAULT_OVERLAP_THRESHOLD: f64 = 0.05;
pub const DEFAULT_EQUILIBRIUM_CUTOFF_MIN: f64 = 10.0;
pub const DEFAULT_TUMOR_LABEL: i32 = 1000;

pub const TEMPLATE_FILE: &str = "mni_icbm152_t1_tal_nlin_asym_09c.nii.gz";
pub const ATLAS_FILE: &str = "dka_atlas_eroded.nii.gz";

/// Input files of one subject, as listed in the cohort config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubjectFiles {
    pub tumor_mri: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pet: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pet4d: Option<PathBuf>,
    #[serde(default, alias = "pet_json", skip_serializing_if = "Option::is_none")]
    pub pet4d_json: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pet4d_dicom: Option<PathBuf>,
    pub mri: PathBuf,
    pub mri_str: PathBuf,
}

impl SubjectFiles {
    /// Join every relative path onto `work_dir`.
    pub fn resolve(&self, work_dir: &Path) -> Self {
        let join = |p: &PathBuf| work_dir.join(p);
        let join_opt = |p: &Option<PathBuf>| p.as_ref().map(join);
        Self {
            tumor_mri: join(&self.tumor_mri),
            pet: join_opt(&self.pet),
            pet4d: join_opt(&self.pet4d),
            pet4d_json: join_opt(&self.pet4d_json),
            pet4d_dicom: join_opt(&self.pet4d_dicom),
            mri: join(&self.mri),
            mri_str: join(&self.mri_str),
        }
    }

    pub fn has_dynamic_series(&self) -> bool {
        self.pet4d.is_some()
    }
}

/// Subjects keyed by id (`sub-XXX`), iterated in sorted order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CohortConfig {
    pub subjects: BTreeMap<String, SubjectFiles>,
}

impl CohortConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| {
            PipelineError::Config(format!("cannot open config {}: {e}", path.display()))
        })?;
        let config: Self = serde_json::from_reader(BufReader::new(file))?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let file = File::create(path)?;
        serde_json::to_writer_pretty(BufWriter::new(file), self)?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.subjects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subjects.is_empty()
    }
}

/// `sub-001` → `001`.
pub fn subject_id(key: &str) -> &str {
    key.strip_prefix("sub-").unwrap_or(key)
}

/// Settings shared by every subject of a run.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub template: PathBuf,
    pub atlas: PathBuf,
    pub convention: AtlasConvention,
    /// Tumour-overlap fraction above which a reference candidate is dropped.
    pub overlap_threshold: f64,
    /// Start of the Patlak window, minutes.
    pub equilibrium_cutoff_min: f64,
    pub tumor_label: i32,
    pub clobber: bool,
    pub threads: Option<usize>,
    pub qc: bool,
}

impl PipelineSettings {
    pub fn new(template: PathBuf, atlas: PathBuf) -> Self {
        Self {
            template,
            atlas,
            convention: AtlasConvention::dka(),
            overlap_threshold: DEFAULT_OVERLAP_THRESHOLD,
            equilibrium_cutoff_min: DEFAULT_EQUILIBRIUM_CUTOFF_MIN,
            tumor_label: DEFAULT_TUMOR_LABEL,
            clobber: false,
            threads: None,
            qc: true,
        }
    }

    /// Template and atlas shipped in `<dir>/atlas/`.
    pub fn with_atlas_dir(dir: &Path) -> Self {
        let atlas_dir = dir.join("atlas");
        Self::new(atlas_dir.join(TEMPLATE_FILE), atlas_dir.join(ATLAS_FILE))
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.overlap_threshold) {
            return Err(PipelineError::Config(format!(
                "overlap threshold {} is not a fraction in [0, 1]",
                self.overlap_threshold
            )));
        }
        if !self.equilibrium_cutoff_min.is_finite() || self.equilibrium_cutoff_min < 0.0 {
            return Err(PipelineError::Config(format!(
                "equilibrium cutoff {} min must be a non-negative number",
                self.equilibrium_cutoff_min
            )));
        }
        if self.tumor_label <= 0 {
            return Err(PipelineError::Config(format!(
                "tumor label {} must be positive",
                self.tumor_label
            )));
        }
        if self.threads == Some(0) {
            return Err(PipelineError::Config("thread count must be at least 1".into()));
        }
        let lateral = self.convention.lateralized();
        if lateral.all_labels().contains(&self.tumor_label) {
            return Err(PipelineError::Config(format!(
                "tumor label {} collides with an atlas label of convention `{}`",
                self.tumor_label, self.convention.name
            )));
        }
        for path in [&self.template, &self.atlas] {
            if !path.exists() {
                return Err(PipelineError::Config(format!(
                    "{} does not exist",
                    path.display()
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_accepts_pet_json_alias_and_optional_pet() {
        let json = r#"{
            "sub-002": {"tumor_mri": "t.nii.gz", "pet4d": "p4.nii.gz", "pet_json": "p.json",
                        "mri": "m.nii.gz", "mri_str": "ms.nii.gz", "notes": "ignored"},
            "sub-001": {"tumor_mri": "t.nii.gz", "pet": "p.nii.gz",
                        "mri": "m.nii.gz", "mri_str": "ms.nii.gz"}
        }"#;
        let config: CohortConfig = serde_json::from_str(json).unwrap();
        let keys: Vec<&String> = config.subjects.keys().collect();
        assert_eq!(keys, ["sub-001", "sub-002"]);

        let second = &config.subjects["sub-002"];
        assert_eq!(second.pet4d_json, Some(PathBuf::from("p.json")));
        assert!(second.pet.is_none());
        assert!(second.has_dynamic_series());
        assert!(!config.subjects["sub-001"].has_dynamic_series());
    }

    #[test]
    fn relative_paths_resolve_against_work_dir() {
        let files = SubjectFiles {
            tumor_mri: "a/t.nii.gz".into(),
            pet: None,
            pet4d: Some("/abs/p4.nii.gz".into()),
            pet4d_json: None,
            pet4d_dicom: None,
            mri: "m.nii.gz".into(),
            mri_str: "ms.nii.gz".into(),
        };
        let resolved = files.resolve(Path::new("/work"));
        assert_eq!(resolved.tumor_mri, PathBuf::from("/work/a/t.nii.gz"));
        assert_eq!(resolved.pet4d, Some(PathBuf::from("/abs/p4.nii.gz")));
    }

    #[test]
    fn subject_ids_drop_the_prefix() {
        assert_eq!(subject_id("sub-001"), "001");
        assert_eq!(subject_id("patient7"), "patient7");
    }

    #[test]
    fn tumor_label_may_not_reuse_an_atlas_label() {
        let mut settings = PipelineSettings::new("/nonexistent/t".into(), "/nonexistent/a".into());
        settings.tumor_label = 50;
        assert!(matches!(settings.validate(), Err(PipelineError::Config(m)) if m.contains("collides")));
        settings.tumor_label = 1000;
        settings.overlap_threshold = 1.5;
        assert!(settings.validate().is_err());
    }
}
