//! Persistence layer: connection pool, schema, migrations, and the
//! in-memory backend.
//!
//! The Postgres implementations of the stores live next to their traits
//! (`pipeline::store`, `tasks::store`, `generation::allocator`); this
//! module owns what they share.

pub mod database;
pub mod memory;
pub mod migrations;
pub mod schema;

use thiserror::Error;
use uuid::Uuid;

use crate::error::{Classify, ErrorKind};

pub use database::Database;
pub use memory::{MemoryAppNumberAllocator, MemoryPipelineStore, MemoryTaskStore};
pub use migrations::SchemaMigrator;

/// Errors shared by all store implementations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Connection to the backend failed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Query execution failed.
    #[error("Query failed: {0}")]
    Query(#[from] sqlx::Error),

    /// Serialization of a persisted document failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Row not found.
    #[error("Record not found: {0}")]
    NotFound(Uuid),

    /// A uniqueness constraint rejected the write.
    #[error("Duplicate record: {0}")]
    Duplicate(String),

    /// A persisted row failed a stored-format check.
    #[error("Corrupt record {id}: {message}")]
    Corrupt { id: Uuid, message: String },

    /// Bringing the schema up to date failed.
    #[error("Migration error: {0}")]
    Migration(#[from] migrations::MigrationError),
}

impl StoreError {
    /// Whether the underlying database error is a unique-constraint
    /// violation (and therefore eligible for the contention retry loop).
    pub fn is_unique_violation(&self) -> bool {
        match self {
            StoreError::Duplicate(_) => true,
            StoreError::Query(sqlx::Error::Database(db)) => {
                // 23505 is Postgres unique_violation.
                db.code().as_deref() == Some("23505")
            }
            _ => false,
        }
    }

    /// Whether the backend reported a serialization/deadlock fault that
    /// a retry on a later tick may clear.
    pub fn is_serialization_fault(&self) -> bool {
        match self {
            StoreError::Query(sqlx::Error::Database(db)) => {
                // 40001 serialization_failure, 40P01 deadlock_detected.
                matches!(db.code().as_deref(), Some("40001") | Some("40P01"))
            }
            _ => false,
        }
    }
}

impl Classify for StoreError {
    fn kind(&self) -> ErrorKind {
        if self.is_unique_violation() {
            return ErrorKind::ResourceContention;
        }
        if self.is_serialization_fault() {
            return ErrorKind::Transient;
        }
        match self {
            StoreError::Corrupt { .. } => ErrorKind::Fatal,
            StoreError::NotFound(_) => ErrorKind::Fatal,
            StoreError::Serialization(_) => ErrorKind::Fatal,
            StoreError::ConnectionFailed(_) => ErrorKind::Fatal,
            StoreError::Duplicate(_) => ErrorKind::ResourceContention,
            StoreError::Query(_) => ErrorKind::Fatal,
            StoreError::Migration(_) => ErrorKind::Fatal,
        }
    }
}
