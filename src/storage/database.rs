//! PostgreSQL connection handling.

use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use super::migrations::SchemaMigrator;
use super::StoreError;

/// How long acquiring a connection may take before the pool gives up.
/// The orchestrator's queries are short; a slot not freeing up within
/// this window means the backend is in trouble, not busy.
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound on pooled connections. Sized for both worker pools plus
/// the poll loop holding a row-lock transaction each.
const MAX_CONNECTIONS: u32 = 16;

/// PostgreSQL database handle shared by the store implementations.
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Connects to the database.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::ConnectionFailed` if no connection could be
    /// established within [`ACQUIRE_TIMEOUT`].
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect(database_url)
            .await
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

        Ok(Self { pool })
    }

    /// Connects and brings the schema up to date. The standard entry
    /// point for long-running processes.
    pub async fn connect_and_migrate(database_url: &str) -> Result<Self, StoreError> {
        let database = Self::connect(database_url).await?;
        database.migrate().await?;
        Ok(database)
    }

    /// Creates a database handle from an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Returns a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Applies pending schema steps; returns how many ran.
    pub async fn migrate(&self) -> Result<usize, StoreError> {
        Ok(SchemaMigrator::new(self.pool.clone()).apply_pending().await?)
    }
}
