//! Pipeline model and persistence.

pub mod execution;
pub mod store;

pub use execution::{
    analysis_key, generation_key, split_analysis_key, AnalysisJob, AnalysisProgress,
    GenerationJob, GenerationProgress, GenerationResult, MatrixConfig, PipelineExecution,
    PipelineStatus, Progress, Stage,
};
pub use store::{PgPipelineStore, PipelineRowLock, PipelineStore};
