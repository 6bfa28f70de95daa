//! Media pipeline lifecycle

pub mod orchestrator;
pub mod service;
pub mod stages;
pub mod worker;

pub use orchestrator::{
    Command, Outcome, PhotoProgress, PipelineOrchestrator, PipelineState, RecordStatus,
};
pub use service::{OrchestratorClient, OrchestratorService, StatusReport};
pub use stages::StageStack;
pub use worker::{StopToken, WorkerHandle};
