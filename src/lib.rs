//! appforge: a two-stage generation-and-analysis pipeline orchestrator.
//!
//! A pipeline describes a matrix of (model, template) generation jobs
//! followed by a matrix of (model, app_number) analysis jobs fanned out
//! to external analyzer services. The orchestrator drives pipelines from
//! persisted records, enforces concurrency and ordering invariants,
//! survives restarts, and guarantees exactly-once creation of analysis
//! tasks.

pub mod analyzers;
pub mod cli;
pub mod config;
pub mod containers;
pub mod engine;
pub mod error;
pub mod generation;
pub mod metrics;
pub mod pipeline;
pub mod storage;
pub mod tasks;

// Re-export the types embedding programs interact with.
pub use analyzers::{
    AnalyzerClient, HealthCache, NormalizeOptions, NormalizedResult, ServiceKind, ToolRegistry,
};
pub use config::OrchestratorConfig;
pub use containers::ContainerManager;
pub use engine::{EngineError, OrchestratorLoop, StageEngine};
pub use error::{Classify, ErrorKind};
pub use generation::{AppNumberAllocator, GenerationService, GenerationWorker};
pub use pipeline::{MatrixConfig, PipelineExecution, PipelineStatus, PipelineStore, Stage};
pub use tasks::{AnalysisTask, TaskExecutor, TaskStatus, TaskStore};
