use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use walkdir::{DirEntry, WalkDir};

use crate::models::config::{CohortConfig, SubjectFiles};

const STATIC_PET_SUFFIX: &str = "_ses-01_pet.nii.gz";

fn is_hidden(entry: &DirEntry) -> bool {
    entry.depth() > 0
        && entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.starts_with('.'))
}

/// Regular files under `root`, sorted, hidden entries skipped.
fn walk_files(root: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(root)
        .into_iter()
        .filter_entry(|e| !is_hidden(e))
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                tracing::warn!(error = %e, "skipping unreadable directory entry");
                None
            }
        })
        .filter(|entry| entry.file_type().is_file())
        .map(DirEntry::into_path)
        .collect();
    files.sort();
    files
}

pub fn collect_dicom_files(input_folder: &Path) -> Vec<PathBuf> {
    walk_files(input_folder)
        .into_iter()
        .filter(|path| looks_like_dicom(path))
        .collect()
}

fn looks_like_dicom(path: &Path) -> bool {
    const MAGIC_OFFSET: usize = 128;
    const BUFFER_SIZE: usize = MAGIC_OFFSET + 4;

    let extension_matches = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| matches!(ext.to_ascii_lowercase().as_str(), "dcm" | "dicom" | "ima"));
    if extension_matches {
        return true;
    }

    let Ok(mut file) = File::open(path) else {
        return false;
    };
    let mut buffer = [0u8; BUFFER_SIZE];
    file.read_exact(&mut buffer).is_ok() && &buffer[MAGIC_OFFSET..] == b"DICM"
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Pet,
    Pet4d,
    Pet4dJson,
    MriStripped,
    Mri,
    Tumor,
}

/// Classify a BIDS file name. Brain-extracted images are matched before
/// plain T1w/FLAIR since they share the modality suffix.
fn role_of(name: &str) -> Option<Role> {
    if name.ends_with(STATIC_PET_SUFFIX) {
        return Some(Role::Pet);
    }
    if name.ends_with("_ses-02_pet.nii.gz") {
        return Some(Role::Pet4d);
    }
    if name.ends_with("_ses-02_pet.json") {
        return Some(Role::Pet4dJson);
    }
    if !name.ends_with(".nii.gz") {
        return None;
    }
    if name.contains("_desc-brain") || name.ends_with("_brain.nii.gz") {
        Some(Role::MriStripped)
    } else if name.ends_with("_T1w.nii.gz") || name.ends_with("_FLAIR.nii.gz") {
        Some(Role::Mri)
    } else if name.contains("_tumor") || name.contains("_mask") {
        Some(Role::Tumor)
    } else {
        None
    }
}

#[derive(Debug, Default)]
struct Found {
    roles: BTreeMap<&'static str, PathBuf>,
}

impl Found {
    fn set(&mut self, key: &'static str, path: PathBuf) {
        if let Some(existing) = self.roles.get(key) {
            tracing::debug!(role = key, kept = %existing.display(), ignored = %path.display(), "duplicate match");
            return;
        }
        self.roles.insert(key, path);
    }

    fn into_files(mut self) -> Result<SubjectFiles, String> {
        let mut required = |key: &str| {
            self.roles
                .remove(key)
                .ok_or_else(|| format!("no file found for `{key}`"))
        };
        let tumor_mri = required("tumor_mri")?;
        let mri = required("mri")?;
        let mri_str = required("mri_str")?;
        Ok(SubjectFiles {
            tumor_mri,
            pet: self.roles.remove("pet"),
            pet4d: self.roles.remove("pet4d"),
            pet4d_json: self.roles.remove("pet4d_json"),
            pet4d_dicom: None,
            mri,
            mri_str,
        })
    }
}

#[derive(Debug, Default)]
pub struct DiscoveryReport {
    pub config: CohortConfig,
    /// Subjects left out, with the reason.
    pub skipped: Vec<(String, String)>,
}

/// Build a cohort config from a BIDS-like tree.
///
/// Subjects are the `sub-*` prefixes of `*_ses-01_pet.nii.gz` files; paths in
/// the config are relative to `data_dir`.
pub fn discover_subjects(data_dir: &Path) -> DiscoveryReport {
    let files = walk_files(data_dir);
    let subject_of = |path: &Path| -> Option<String> {
        let name = path.file_name()?.to_str()?;
        name.strip_suffix(STATIC_PET_SUFFIX)?;
        Some(name.split('_').next()?.to_string())
    };
    let mut subjects: BTreeMap<String, Found> = files
        .iter()
        .filter_map(|p| subject_of(p))
        .map(|id| (id, Found::default()))
        .collect();

    for path in &files {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some(id) = name.split('_').next() else {
            continue;
        };
        let (Some(found), Some(role)) = (subjects.get_mut(id), role_of(name)) else {
            continue;
        };
        let relative = path.strip_prefix(data_dir).unwrap_or(path).to_path_buf();
        let key = match role {
            Role::Pet => "pet",
            Role::Pet4d => "pet4d",
            Role::Pet4dJson => "pet4d_json",
            Role::MriStripped => "mri_str",
            Role::Mri => "mri",
            Role::Tumor => "tumor_mri",
        };
        found.set(key, relative);
    }

    let mut report = DiscoveryReport::default();
    for (id, found) in subjects {
        match found.into_files() {
            Ok(files) => {
                report.config.subjects.insert(id, files);
            }
            Err(reason) => report.skipped.push((id, reason)),
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn touch(root: &Path, rel: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"").unwrap();
    }

    #[test]
    fn roles_are_matched_by_suffix() {
        assert_eq!(role_of("sub-1_ses-01_pet.nii.gz"), Some(Role::Pet));
        assert_eq!(role_of("sub-1_desc-brain_T1w.nii.gz"), Some(Role::MriStripped));
        assert_eq!(role_of("sub-1_T1w.nii.gz"), Some(Role::Mri));
        assert_eq!(role_of("sub-1_tumor.nii.gz"), Some(Role::Tumor));
        assert_eq!(role_of("sub-1_ses-02_pet.json"), Some(Role::Pet4dJson));
        assert_eq!(role_of("sub-1_T1w.json"), None);
    }

    #[test]
    fn discovers_complete_subjects_and_reports_incomplete_ones() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        touch(root, "sub-001/ses-01/pet/sub-001_ses-01_pet.nii.gz");
        touch(root, "sub-001/ses-02/pet/sub-001_ses-02_pet.nii.gz");
        touch(root, "sub-001/ses-02/pet/sub-001_ses-02_pet.json");
        touch(root, "sub-001/anat/sub-001_T1w.nii.gz");
        touch(root, "sub-001/anat/sub-001_desc-brain_T1w.nii.gz");
        touch(root, "sub-001/anat/sub-001_tumor.nii.gz");
        touch(root, "sub-002/ses-01/pet/sub-002_ses-01_pet.nii.gz");
        touch(root, "sub-002/anat/sub-002_T1w.nii.gz");
        touch(root, ".cache/sub-003_ses-01_pet.nii.gz");

        let report = discover_subjects(root);
        assert_eq!(report.config.len(), 1);
        let files = &report.config.subjects["sub-001"];
        assert_eq!(files.mri, PathBuf::from("sub-001/anat/sub-001_T1w.nii.gz"));
        assert_eq!(files.mri_str, PathBuf::from("sub-001/anat/sub-001_desc-brain_T1w.nii.gz"));
        assert!(files.pet4d_json.is_some());
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].0, "sub-002");
    }

    #[test]
    fn dicom_files_are_found_by_extension_or_magic() {
        let dir = tempdir().unwrap();
        touch(dir.path(), "a/IM0001.dcm");
        let mut magic = vec![0u8; 128];
        magic.extend_from_slice(b"DICM");
        fs::write(dir.path().join("a/noext"), magic).unwrap();
        fs::write(dir.path().join("a/notes.txt"), b"hello").unwrap();

        let found = collect_dicom_files(dir.path());
        assert_eq!(found.len(), 2);
    }
}
