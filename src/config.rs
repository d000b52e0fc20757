//! Orchestrator configuration.
//!
//! Module-scope constants fix the scheduling envelope (poll cadence, pool
//! sizes, retry budgets, shutdown deadlines); `OrchestratorConfig` carries
//! the deployment-specific settings loaded from the environment (database
//! URL, analyzer endpoints, raw-output handling).

use std::time::Duration;

use thiserror::Error;

use crate::error::{Classify, ErrorKind};

/// Cadence at which the orchestrator scans for running pipelines.
pub const POLL_INTERVAL: Duration = Duration::from_secs(3);

/// Per-pipeline generation concurrency when the config does not set one.
pub const DEFAULT_MAX_CONCURRENT_GENERATION: usize = 2;

/// Per-pipeline analysis concurrency when the config does not set one.
pub const DEFAULT_MAX_CONCURRENT_ANALYSIS: usize = 3;

/// Process-wide generation worker pool size.
pub const MAX_GENERATION_WORKERS: usize = 4;

/// Process-wide analysis worker pool size.
pub const MAX_ANALYSIS_WORKERS: usize = 8;

/// Wait after starting an analyzer container before first use.
pub const CONTAINER_STABILIZATION_DELAY: Duration = Duration::from_secs(5);

/// Delay between analyzer health retries.
pub const CONTAINER_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Maximum wait for in-flight workers on graceful stop.
pub const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Maximum wait to join pool workers after the shutdown signal.
pub const THREAD_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Retry budget for contended reservations (app numbers, task creation)
/// and for retry-bucket re-dispatch across ticks.
pub const MAX_TASK_CREATION_RETRIES: u32 = 3;

/// Positive-result lifetime of the analyzer reachability cache.
pub const HEALTH_CACHE_TTL: Duration = Duration::from_secs(30);

/// Default truncation threshold for per-tool issue arrays.
pub const DEFAULT_RAW_OUTPUT_MAX_ISSUES: usize = 50;

/// Errors that can occur while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

impl Classify for ConfigError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Configuration
    }
}

/// Deployment configuration for the orchestrator process.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// PostgreSQL connection string.
    pub database_url: String,
    /// Base URL under which analyzer services are reachable
    /// (per-service ports are appended by the client).
    pub analyzer_base_url: String,
    /// Endpoint of the external generation service.
    pub generation_service_url: String,
    /// Keep per-tool issue/stdout payloads in normalized results.
    pub full_raw_outputs: bool,
    /// Truncation threshold for per-tool issue arrays.
    pub raw_output_max_issues: usize,
    /// Advisory flag forwarded to the result-persistence collaborator.
    pub single_file_results: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost/appforge".to_string(),
            analyzer_base_url: "http://localhost".to_string(),
            generation_service_url: "http://localhost:9050".to_string(),
            full_raw_outputs: false,
            raw_output_max_issues: DEFAULT_RAW_OUTPUT_MAX_ISSUES,
            single_file_results: false,
        }
    }
}

impl OrchestratorConfig {
    /// Loads configuration from environment variables.
    ///
    /// `DATABASE_URL` is required; everything else falls back to defaults.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if `DATABASE_URL` is unset or a numeric
    /// variable fails to parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| ConfigError::MissingEnvVar("DATABASE_URL".to_string()))?;

        let defaults = Self::default();

        let analyzer_base_url =
            std::env::var("ANALYZER_BASE_URL").unwrap_or(defaults.analyzer_base_url);
        let generation_service_url =
            std::env::var("GENERATION_SERVICE_URL").unwrap_or(defaults.generation_service_url);

        let full_raw_outputs = env_flag("FULL_RAW_OUTPUTS");
        let single_file_results = env_flag("SINGLE_FILE_RESULTS");

        let raw_output_max_issues = match std::env::var("RAW_OUTPUT_MAX_ISSUES") {
            Ok(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue {
                key: "RAW_OUTPUT_MAX_ISSUES".to_string(),
                message: format!("expected a non-negative integer, got '{}'", raw),
            })?,
            Err(_) => DEFAULT_RAW_OUTPUT_MAX_ISSUES,
        };

        let config = Self {
            database_url,
            analyzer_base_url,
            generation_service_url,
            full_raw_outputs,
            raw_output_max_issues,
            single_file_results,
        };
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if a URL field is empty.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database_url.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "database_url must not be empty".to_string(),
            ));
        }
        if self.analyzer_base_url.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "analyzer_base_url must not be empty".to_string(),
            ));
        }
        if self.generation_service_url.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "generation_service_url must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Reads a boolean environment flag ("1"/"true"/"yes" enable it).
fn env_flag(key: &str) -> bool {
    match std::env::var(key) {
        Ok(raw) => matches!(raw.to_ascii_lowercase().as_str(), "1" | "true" | "yes"),
        Err(_) => false,
    }
}
