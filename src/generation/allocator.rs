//! App number allocation.
//!
//! The only place app numbers are minted. Reservation inserts
//! `(model, highest + 1)` under the unique constraint on
//! `generated_applications (model, app_number)`; a unique violation means
//! another worker won the race, so the attempt backs off with jitter and
//! re-reads. The generation result records the reserved number; nothing
//! else may re-mint for the same pipeline job.

use std::time::Duration;

use async_trait::async_trait;
use rand::RngExt;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::MAX_TASK_CREATION_RETRIES;
use crate::error::{Classify, ErrorKind};

/// Errors that can occur while reserving an app number.
#[derive(Debug, Error)]
pub enum AllocatorError {
    /// Every retry lost the insert race.
    #[error("App number contention for model '{model}' after {attempts} attempts")]
    Contention { model: String, attempts: u32 },

    /// Database failure outside the unique-violation path.
    #[error("Allocation query failed: {0}")]
    Database(#[from] sqlx::Error),
}

impl Classify for AllocatorError {
    fn kind(&self) -> ErrorKind {
        match self {
            AllocatorError::Contention { .. } => ErrorKind::ResourceContention,
            AllocatorError::Database(_) => ErrorKind::Fatal,
        }
    }
}

/// Reservation of a unique `(model, app_number)` pair under contention.
#[async_trait]
pub trait AppNumberAllocator: Send + Sync {
    /// Reserves the next free app number for `model`.
    ///
    /// # Errors
    ///
    /// Returns `AllocatorError::Contention` once the retry budget is
    /// exhausted.
    async fn reserve(&self, model: &str) -> Result<u32, AllocatorError>;
}

/// Postgres-backed allocator over `generated_applications`.
pub struct PgAppNumberAllocator {
    pool: PgPool,
}

impl PgAppNumberAllocator {
    /// Creates an allocator over an existing pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn try_reserve(&self, model: &str) -> Result<Result<u32, ()>, AllocatorError> {
        let mut tx = self.pool.begin().await?;

        // Lock the current highest row for the model so concurrent
        // reservations serialize here on locking backends; the unique
        // constraint remains the hard guard either way.
        let row = sqlx::query(
            r#"
            SELECT app_number FROM generated_applications
            WHERE model = $1
            ORDER BY app_number DESC
            LIMIT 1
            FOR UPDATE
            "#,
        )
        .bind(model)
        .fetch_optional(&mut *tx)
        .await?;

        let highest: i32 = row.map(|r| r.get("app_number")).unwrap_or(0);
        let candidate = highest + 1;

        let inserted =
            sqlx::query("INSERT INTO generated_applications (model, app_number) VALUES ($1, $2)")
                .bind(model)
                .bind(candidate)
                .execute(&mut *tx)
                .await;

        match inserted {
            Ok(_) => {
                tx.commit().await?;
                debug!(model = %model, app_number = candidate, "Reserved app number");
                Ok(Ok(candidate as u32))
            }
            Err(sqlx::Error::Database(db)) if db.code().as_deref() == Some("23505") => {
                // Lost the race; the transaction rolls back on drop.
                Ok(Err(()))
            }
            Err(e) => Err(AllocatorError::Database(e)),
        }
    }
}

#[async_trait]
impl AppNumberAllocator for PgAppNumberAllocator {
    async fn reserve(&self, model: &str) -> Result<u32, AllocatorError> {
        for attempt in 0..MAX_TASK_CREATION_RETRIES {
            match self.try_reserve(model).await? {
                Ok(app_number) => return Ok(app_number),
                Err(()) => {
                    let delay = contention_backoff(attempt);
                    warn!(
                        model = %model,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        "App number insert lost uniqueness race, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
        Err(AllocatorError::Contention {
            model: model.to_string(),
            attempts: MAX_TASK_CREATION_RETRIES,
        })
    }
}

/// Jittered exponential backoff for contended reservations:
/// `10ms * 2^attempt` plus up to 50% jitter.
pub fn contention_backoff(attempt: u32) -> Duration {
    let base_ms = 10u64.saturating_mul(1 << attempt.min(8));
    let jitter_ms = rand::rng().random_range(0..=base_ms / 2);
    Duration::from_millis(base_ms + jitter_ms)
}
