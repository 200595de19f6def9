pub mod dicom_frames;
pub mod kinetics;
pub mod regions;
pub mod static_analysis;
pub mod subject;
pub mod tacs;
pub mod workflow;
