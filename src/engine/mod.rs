//! The pipeline execution engine: stage state machine, worker pools, and
//! the top-level orchestrator loop.

pub mod orchestrator;
pub mod pool;
pub mod stage;

use thiserror::Error;

use crate::analyzers::client::AnalyzerError;
use crate::analyzers::registry::RegistryError;
use crate::containers::ContainerError;
use crate::error::{Classify, ErrorKind};
use crate::generation::allocator::AllocatorError;
use crate::storage::StoreError;

pub use orchestrator::OrchestratorLoop;
pub use pool::WorkerPool;
pub use stage::{EngineTuning, StageEngine};

/// Errors surfaced by the engine. The loop dispatches on
/// [`Classify::kind`]: only `Fatal` kinds mark a pipeline failed.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Persistence failure.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Tool/service resolution failure.
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Container lifecycle failure.
    #[error("Container error: {0}")]
    Container(#[from] ContainerError),

    /// Analyzer transport failure.
    #[error("Analyzer error: {0}")]
    Analyzer(#[from] AnalyzerError),

    /// App number reservation failure.
    #[error("Allocator error: {0}")]
    Allocator(#[from] AllocatorError),
}

impl Classify for EngineError {
    fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Store(e) => e.kind(),
            EngineError::Registry(e) => e.kind(),
            EngineError::Container(e) => e.kind(),
            EngineError::Analyzer(e) => e.kind(),
            EngineError::Allocator(e) => e.kind(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_engine_error_kind_delegation() {
        let err = EngineError::Store(StoreError::NotFound(Uuid::new_v4()));
        assert_eq!(err.kind(), ErrorKind::Fatal);

        let err = EngineError::Registry(RegistryError::UnknownTool("x".to_string()));
        assert_eq!(err.kind(), ErrorKind::Configuration);

        let err = EngineError::Store(StoreError::Duplicate("main".to_string()));
        assert_eq!(err.kind(), ErrorKind::ResourceContention);
    }
}
