//! Pipeline persistence.
//!
//! `PipelineStore` is the seam between the engine and the backend. The
//! Postgres implementation provides true mutual exclusion through
//! `SELECT … FOR UPDATE` row locks; the in-memory implementation in
//! `storage::memory` degrades to per-row async mutexes plus the engine's
//! bounded retry loop. Operators running many orchestrator-adjacent
//! writers should prefer the locking backend.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use crate::storage::StoreError;

use super::execution::{
    MatrixConfig, PipelineExecution, PipelineStatus, Progress, Stage,
};

/// Durable pipeline operations. Every method is visible before it
/// returns.
#[async_trait]
pub trait PipelineStore: Send + Sync {
    /// Persists a new pipeline in `pending` state with frozen config.
    async fn create(&self, config: MatrixConfig) -> Result<PipelineExecution, StoreError>;

    /// All pipelines with `status = running`, ordered by id so every
    /// tick visits them in a stable order.
    async fn list_running(&self) -> Result<Vec<PipelineExecution>, StoreError>;

    /// All pipelines regardless of status, ordered by id.
    async fn list_all(&self) -> Result<Vec<PipelineExecution>, StoreError>;

    /// Loads one pipeline.
    async fn load(&self, id: Uuid) -> Result<PipelineExecution, StoreError>;

    /// Persists the full row. `updated_at` is refreshed on the way out.
    async fn commit(&self, pipeline: &mut PipelineExecution) -> Result<(), StoreError>;

    /// Acquires a pessimistic lock on the row and returns a guard holding
    /// the freshly-loaded pipeline. Dropping the guard without calling
    /// [`PipelineRowLock::commit`] releases the lock and discards all
    /// staged mutations.
    async fn lock(&self, id: Uuid) -> Result<Box<dyn PipelineRowLock>, StoreError>;
}

/// Guard over a locked pipeline row.
///
/// Mutations staged through [`PipelineRowLock::pipeline`] become durable
/// atomically when the guard is committed. This is the critical section
/// every dedup-set update, job-index advance and retry-bucket move runs
/// in.
#[async_trait]
pub trait PipelineRowLock: Send {
    /// The locked row, mutable in place.
    fn pipeline(&mut self) -> &mut PipelineExecution;

    /// Increments `current_job_index`. Durable at commit, atomically with
    /// every other staged mutation.
    fn advance_job_index(&mut self) {
        self.pipeline().current_job_index += 1;
    }

    /// Moves `key` out of the active set of `stage` into its retry
    /// bucket. Returns the attempt count after the move.
    fn mark_job_retryable(&mut self, stage: Stage, key: &str) -> u32 {
        let progress = &mut self.pipeline().progress;
        match stage {
            Stage::Generation => {
                progress.generation.in_flight_keys.remove(key);
                let attempts = progress
                    .generation
                    .retryable_keys
                    .entry(key.to_string())
                    .or_insert(0);
                *attempts += 1;
                *attempts
            }
            Stage::Analysis | Stage::Done => progress.analysis.mark_retryable(key),
        }
    }

    /// Persists the row and releases the lock.
    async fn commit(self: Box<Self>) -> Result<PipelineExecution, StoreError>;
}

/// Postgres-backed pipeline store.
pub struct PgPipelineStore {
    pool: PgPool,
}

impl PgPipelineStore {
    /// Creates a store over an existing pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_pipeline(row: &sqlx::postgres::PgRow) -> Result<PipelineExecution, StoreError> {
        let id: Uuid = row.get("id");
        let status_raw: String = row.get("status");
        let stage_raw: String = row.get("current_stage");
        let current_job_index: i64 = row.get("current_job_index");
        let config_json: serde_json::Value = row.get("config_json");
        let progress_json: serde_json::Value = row.get("progress_json");
        let created_at: DateTime<Utc> = row.get("created_at");
        let updated_at: DateTime<Utc> = row.get("updated_at");

        let status = PipelineStatus::parse(&status_raw).ok_or_else(|| StoreError::Corrupt {
            id,
            message: format!("unknown status '{}'", status_raw),
        })?;
        let current_stage = Stage::parse(&stage_raw).ok_or_else(|| StoreError::Corrupt {
            id,
            message: format!("unknown stage '{}'", stage_raw),
        })?;
        let config: MatrixConfig = serde_json::from_value(config_json)?;
        let progress: Progress = serde_json::from_value(progress_json)?;

        Ok(PipelineExecution {
            id,
            status,
            current_stage,
            current_job_index: current_job_index as usize,
            config,
            progress,
            created_at,
            updated_at,
        })
    }

    async fn write_row(
        tx: &mut Transaction<'static, Postgres>,
        pipeline: &PipelineExecution,
    ) -> Result<(), StoreError> {
        let config_json = serde_json::to_value(&pipeline.config)?;
        let progress_json = serde_json::to_value(&pipeline.progress)?;

        sqlx::query(
            r#"
            UPDATE pipeline_executions
            SET status = $2, current_stage = $3, current_job_index = $4,
                config_json = $5, progress_json = $6, updated_at = $7
            WHERE id = $1
            "#,
        )
        .bind(pipeline.id)
        .bind(pipeline.status.as_str())
        .bind(pipeline.current_stage.as_str())
        .bind(pipeline.current_job_index as i64)
        .bind(&config_json)
        .bind(&progress_json)
        .bind(pipeline.updated_at)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl PipelineStore for PgPipelineStore {
    async fn create(&self, config: MatrixConfig) -> Result<PipelineExecution, StoreError> {
        let pipeline = PipelineExecution::new(config);
        let config_json = serde_json::to_value(&pipeline.config)?;
        let progress_json = serde_json::to_value(&pipeline.progress)?;

        sqlx::query(
            r#"
            INSERT INTO pipeline_executions (
                id, status, current_stage, current_job_index,
                config_json, progress_json, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(pipeline.id)
        .bind(pipeline.status.as_str())
        .bind(pipeline.current_stage.as_str())
        .bind(pipeline.current_job_index as i64)
        .bind(&config_json)
        .bind(&progress_json)
        .bind(pipeline.created_at)
        .bind(pipeline.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(pipeline)
    }

    async fn list_running(&self) -> Result<Vec<PipelineExecution>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM pipeline_executions WHERE status = 'running' ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_pipeline).collect()
    }

    async fn list_all(&self) -> Result<Vec<PipelineExecution>, StoreError> {
        let rows = sqlx::query("SELECT * FROM pipeline_executions ORDER BY id")
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(Self::row_to_pipeline).collect()
    }

    async fn load(&self, id: Uuid) -> Result<PipelineExecution, StoreError> {
        let row = sqlx::query("SELECT * FROM pipeline_executions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound(id))?;

        Self::row_to_pipeline(&row)
    }

    async fn commit(&self, pipeline: &mut PipelineExecution) -> Result<(), StoreError> {
        pipeline.updated_at = Utc::now();
        let mut tx = self.pool.begin().await?;
        Self::write_row(&mut tx, pipeline).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn lock(&self, id: Uuid) -> Result<Box<dyn PipelineRowLock>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT * FROM pipeline_executions WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(StoreError::NotFound(id))?;

        let pipeline = Self::row_to_pipeline(&row)?;
        Ok(Box::new(PgPipelineRowLock { tx, pipeline }))
    }
}

/// Postgres row-lock guard; holds the transaction open until commit or
/// drop (drop rolls back, discarding staged mutations).
struct PgPipelineRowLock {
    tx: Transaction<'static, Postgres>,
    pipeline: PipelineExecution,
}

#[async_trait]
impl PipelineRowLock for PgPipelineRowLock {
    fn pipeline(&mut self) -> &mut PipelineExecution {
        &mut self.pipeline
    }

    async fn commit(mut self: Box<Self>) -> Result<PipelineExecution, StoreError> {
        self.pipeline.updated_at = Utc::now();
        PgPipelineStore::write_row(&mut self.tx, &self.pipeline).await?;
        self.tx.commit().await?;
        Ok(self.pipeline)
    }
}
