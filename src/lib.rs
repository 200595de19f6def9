//! Subject-level FDOPA PET/MRI quantification.
//!
//! Each subject is aligned to its PET, the template atlas is carried into PET
//! space, striatal ROI and reference regions are chosen around the tumour and
//! uptake is summarised statically and, for dynamic series, by a Patlak fit.

pub mod cli;
pub mod error;
pub mod logic;
pub mod models;
pub mod progress;
pub mod registration;
pub mod resample;
pub mod utils;
pub mod volume;

pub use error::{ErrorKind, PipelineError, Result};
