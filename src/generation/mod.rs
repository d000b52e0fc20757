//! Generation boundary: the external app-building service and the worker
//! that drives one generation job.
//!
//! The generative model, prompt templating and port allocation all live
//! on the far side of `GenerationService`; the orchestrator only reserves
//! the app number and records the outcome.

pub mod allocator;
pub mod worker;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

pub use allocator::{AllocatorError, AppNumberAllocator, PgAppNumberAllocator};
pub use worker::GenerationWorker;

/// Outcome reported by the generation service for one app build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildOutcome {
    /// Whether the app was fully generated.
    pub success: bool,
    /// Failure description, when generation failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BuildOutcome {
    /// A successful build.
    pub fn success() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    /// A failed build.
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
        }
    }
}

/// The external service that turns a (model, template) pair into a
/// runnable app under a reserved app number.
#[async_trait]
pub trait GenerationService: Send + Sync {
    /// Generates one full app. Infrastructure failures are reported as
    /// unsuccessful outcomes, not errors; the worker records either way.
    async fn generate_full_app(&self, model: &str, template: &str, app_number: u32)
        -> BuildOutcome;
}

/// HTTP client for a generation service deployed as its own process.
pub struct HttpGenerationService {
    http: reqwest::Client,
    endpoint: String,
}

impl HttpGenerationService {
    /// Creates a client against the service's base URL.
    pub fn new(endpoint: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
        }
    }
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    template: &'a str,
    app_number: u32,
}

#[async_trait]
impl GenerationService for HttpGenerationService {
    async fn generate_full_app(
        &self,
        model: &str,
        template: &str,
        app_number: u32,
    ) -> BuildOutcome {
        let url = format!("{}/generate", self.endpoint);
        debug!(model = %model, template = %template, app_number, "Requesting app generation");

        let request = GenerateRequest {
            model,
            template,
            app_number,
        };
        match self.http.post(&url).json(&request).send().await {
            Ok(response) if response.status().is_success() => {
                match response.json::<BuildOutcome>().await {
                    Ok(outcome) => outcome,
                    Err(e) => BuildOutcome::failure(format!("undecodable response: {}", e)),
                }
            }
            Ok(response) => {
                BuildOutcome::failure(format!("generation service returned {}", response.status()))
            }
            Err(e) => BuildOutcome::failure(format!("generation service unreachable: {}", e)),
        }
    }
}
