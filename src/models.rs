pub mod config;
pub mod frames;
pub mod regions;
pub mod results;

pub use config::{CohortConfig, PipelineSettings, SubjectFiles};
pub use frames::{Frame, FrameTiming};
pub use regions::{AtlasConvention, Hemisphere, HemisphereLayout, RegionLabelSet, Structure};
pub use results::{
    DynamicOutcome, ExcludedRegion, PatlakFit, PetSpaceVolumes, RegionSelection, StaticAnalysis,
    SubjectResults, SuvrSummary, TacFrame, TacTable, TransformChain,
};
