//! Error classification for orchestrator subsystems.
//!
//! Each subsystem defines its own `thiserror` enum next to the code that
//! produces it. This module defines the cross-cutting classification the
//! engine dispatches on: every subsystem error maps onto one `ErrorKind`,
//! which decides whether a failure is retried, parked in a retry bucket,
//! recorded on the task, or fails the whole pipeline.

use serde::{Deserialize, Serialize};

/// How an error propagates through the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Unknown tool/service or invalid pipeline config. Fails the pipeline
    /// at stage start.
    Configuration,
    /// Uniqueness exhausted after retries (app numbers, task creation).
    /// Moves the job to the retry bucket.
    ResourceContention,
    /// Container start, analyzer unreachable, serialization fault.
    /// Retried per call policy, then parked in the retry bucket.
    Transient,
    /// A tool returned non-success or timed out. Recorded on the task,
    /// never fails the pipeline.
    Task,
    /// Storage unavailable or progress-document integrity violation.
    /// Marks the pipeline failed; other pipelines continue.
    Fatal,
}

impl ErrorKind {
    /// Whether jobs hitting this kind are eligible for the retry bucket.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::ResourceContention | ErrorKind::Transient)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Configuration => write!(f, "configuration"),
            ErrorKind::ResourceContention => write!(f, "resource_contention"),
            ErrorKind::Transient => write!(f, "transient"),
            ErrorKind::Task => write!(f, "task"),
            ErrorKind::Fatal => write!(f, "fatal"),
        }
    }
}

/// Implemented by every subsystem error so the engine can branch on
/// classification without knowing concrete types.
pub trait Classify {
    /// The propagation class of this error.
    fn kind(&self) -> ErrorKind;
}
