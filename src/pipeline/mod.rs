// Transform-and-load pipeline: artifacts, processing, loading and storage

pub mod artifact;
pub mod events;
pub mod load;
pub mod orchestrator;
pub mod processing;
pub mod storage;
pub mod transform;

pub use orchestrator::{PipelineCoordinator, PipelineReport, PipelineStage, PipelineStatus};
