//! Schema migration.
//!
//! Applied steps are tracked by name in `schema_history`. A run loads
//! the recorded names once, then applies every missing step inside a
//! single transaction: either the whole pending batch lands or the
//! schema stays at its previous version, never halfway.

use std::collections::HashSet;

use sqlx::{PgPool, Row};
use thiserror::Error;
use tracing::info;

use super::schema;

/// Errors that can occur while migrating the schema.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// Database query failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A schema step failed to execute; the batch was rolled back.
    #[error("Schema step '{name}' failed: {message}")]
    StepFailed { name: String, message: String },
}

/// Brings the database schema up to date.
pub struct SchemaMigrator {
    pool: PgPool,
}

impl SchemaMigrator {
    /// Creates a migrator over an existing pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Applies every schema step whose name is not yet recorded.
    /// Idempotent; returns the number of steps applied.
    pub async fn apply_pending(&self) -> Result<usize, MigrationError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS schema_history (
                name TEXT PRIMARY KEY,
                applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&mut *tx)
        .await?;

        let recorded: HashSet<String> = sqlx::query("SELECT name FROM schema_history")
            .fetch_all(&mut *tx)
            .await?
            .into_iter()
            .map(|row| row.get("name"))
            .collect();

        let mut applied = 0;
        for step in schema::schema_steps() {
            if recorded.contains(step.name) {
                continue;
            }
            sqlx::query(step.sql)
                .execute(&mut *tx)
                .await
                .map_err(|e| MigrationError::StepFailed {
                    name: step.name.to_string(),
                    message: e.to_string(),
                })?;
            sqlx::query("INSERT INTO schema_history (name) VALUES ($1)")
                .bind(step.name)
                .execute(&mut *tx)
                .await?;
            applied += 1;
        }

        tx.commit().await?;

        if applied > 0 {
            info!(applied, "Applied schema steps");
        }
        Ok(applied)
    }
}
