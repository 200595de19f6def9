use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;

/// Failure categories reported per subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Registration,
    AtlasConvention,
    InsufficientData,
    Geometry,
    QcArtifact,
    Io,
    Config,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("registration failed during {stage}: {reason}")]
    Registration { stage: String, reason: String },

    #[error("failed to launch `{program}`: {source}")]
    BackendLaunch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("transform file {} is not supported by this backend", .0.display())]
    UnsupportedTransform(PathBuf),

    #[error("atlas is missing labels {missing:?} expected for {region}")]
    AtlasConvention { region: String, missing: Vec<i32> },

    #[error("tumor mask {} has no voxels inside the brain in PET space", .0.display())]
    EmptyTumor(PathBuf),

    #[error("region `{0}` has no voxels in PET space")]
    EmptyRegion(String),

    #[error(
        "insufficient frames for regression: {available} usable after {cutoff_min} min, need at least {required}"
    )]
    InsufficientFrames {
        available: usize,
        required: usize,
        cutoff_min: f64,
    },

    #[error("dynamic PET has {volumes} frames but its metadata declares {declared}")]
    FrameCountMismatch { volumes: usize, declared: usize },

    #[error("invalid frame metadata: {0}")]
    FrameMetadata(String),

    #[error("grid mismatch: expected {expected}, found {found}")]
    GridMismatch { expected: String, found: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("DICOM error: {0}")]
    Dicom(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Nifti(#[from] nifti::NiftiError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Image(#[from] image::ImageError),
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Registration { .. } | Self::BackendLaunch { .. } | Self::UnsupportedTransform(_) => {
                ErrorKind::Registration
            }
            Self::AtlasConvention { .. } | Self::EmptyTumor(_) | Self::EmptyRegion(_) => {
                ErrorKind::AtlasConvention
            }
            Self::InsufficientFrames { .. }
            | Self::FrameCountMismatch { .. }
            | Self::FrameMetadata(_)
            | Self::Dicom(_) => ErrorKind::InsufficientData,
            Self::GridMismatch { .. } => ErrorKind::Geometry,
            Self::Image(_) => ErrorKind::QcArtifact,
            Self::Io(_) | Self::Nifti(_) | Self::Csv(_) => ErrorKind::Io,
            Self::Config(_) | Self::Json(_) => ErrorKind::Config,
        }
    }

    /// Errors that only invalidate the dynamic branch of a subject.
    pub fn is_dynamic_only(&self) -> bool {
        matches!(
            self,
            Self::InsufficientFrames { .. }
                | Self::FrameCountMismatch { .. }
                | Self::FrameMetadata(_)
                | Self::Dicom(_)
        )
    }

    pub(crate) fn registration(stage: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Registration {
            stage: stage.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insufficient_frames_is_dynamic_only() {
        let err = PipelineError::InsufficientFrames {
            available: 1,
            required: 2,
            cutoff_min: 10.0,
        };
        assert!(err.is_dynamic_only());
        assert_eq!(err.kind(), ErrorKind::InsufficientData);
        assert!(err.to_string().contains("insufficient frames for regression"));
    }

    #[test]
    fn registration_failure_is_fatal() {
        let err = PipelineError::registration("mri2pet", "exit status 1");
        assert!(!err.is_dynamic_only());
        assert_eq!(err.kind(), ErrorKind::Registration);
    }
}
