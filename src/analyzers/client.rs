//! Analyzer service client.
//!
//! Translates an analysis job into the wire request the analyzer
//! containers accept and hands the nested response to
//! [`crate::analyzers::normalize`]. The trait seam exists so the engine
//! and task executor can be driven by stub analyzers in tests.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::error::{Classify, ErrorKind};

use super::registry::ServiceKind;

/// Errors that can occur while talking to analyzer services.
#[derive(Debug, Error)]
pub enum AnalyzerError {
    /// The service did not accept a connection.
    #[error("Analyzer '{service}' unreachable: {message}")]
    Unreachable { service: ServiceKind, message: String },

    /// The service answered with a non-success HTTP status.
    #[error("Analyzer '{service}' request failed with status {status}")]
    RequestFailed { service: ServiceKind, status: u16 },

    /// The response body could not be decoded.
    #[error("Failed to parse analyzer response: {0}")]
    ParseError(String),

    /// The call exceeded its deadline.
    #[error("Analyzer call timed out after {0:?}")]
    Timeout(Duration),

    /// Transport-level failure.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl Classify for AnalyzerError {
    fn kind(&self) -> ErrorKind {
        match self {
            AnalyzerError::Unreachable { .. }
            | AnalyzerError::RequestFailed { .. }
            | AnalyzerError::Http(_) => ErrorKind::Transient,
            // A timed-out or undecodable run is recorded on the task, it
            // does not park the job for re-dispatch.
            AnalyzerError::Timeout(_) | AnalyzerError::ParseError(_) => ErrorKind::Task,
        }
    }
}

/// The request envelope analyzer containers accept.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzerRequest {
    /// Always `"analyze"`.
    pub command: String,
    /// Wire name of the target service.
    pub service: String,
    /// Model slug that produced the app.
    pub model: String,
    /// App number under that model.
    pub app_number: u32,
    /// Canonical tool names to run.
    pub tools: Vec<String>,
    /// Per-service options, passed through verbatim.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub options: Value,
}

impl AnalyzerRequest {
    /// Builds an analyze request for one service/tool group.
    pub fn analyze(service: ServiceKind, model: &str, app_number: u32, tools: &[String]) -> Self {
        Self {
            command: "analyze".to_string(),
            service: service.as_str().to_string(),
            model: model.to_string(),
            app_number,
            tools: tools.to_vec(),
            options: Value::Null,
        }
    }

    /// Attaches per-service options.
    pub fn with_options(mut self, options: Value) -> Self {
        self.options = options;
        self
    }
}

/// The nested response as received from an analyzer container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawAnalyzerResponse {
    /// Nested result document
    /// (`analysis.results.<language>.<tool>` inside).
    #[serde(default)]
    pub results: Value,
    /// Response metadata; carries the run timestamps.
    #[serde(default)]
    pub metadata: Value,
}

/// Client seam over the analyzer fleet.
#[async_trait]
pub trait AnalyzerClient: Send + Sync {
    /// Runs a tool group on one service against a generated app.
    ///
    /// # Errors
    ///
    /// Returns `AnalyzerError` on transport failure, non-success HTTP
    /// status, undecodable body, or deadline expiry.
    async fn run_tools(
        &self,
        service: ServiceKind,
        model: &str,
        app_number: u32,
        tools: &[String],
        timeout: Duration,
    ) -> Result<RawAnalyzerResponse, AnalyzerError>;

    /// Reachability probe, consumed by the health cache. Must be cheap
    /// and must not mutate analyzer state.
    async fn ping(&self, service: ServiceKind) -> bool;
}

/// HTTP implementation speaking to analyzer containers over reqwest.
pub struct HttpAnalyzerClient {
    http: reqwest::Client,
    endpoints: HashMap<ServiceKind, String>,
}

impl HttpAnalyzerClient {
    /// Creates a client deriving per-service endpoints from a base URL
    /// and each service's default port
    /// (e.g. `http://localhost` -> `http://localhost:2001`).
    pub fn new(base_url: &str) -> Self {
        let base = base_url.trim_end_matches('/');
        let endpoints = ServiceKind::all()
            .into_iter()
            .map(|service| (service, format!("{}:{}", base, service.default_port())))
            .collect();
        Self {
            http: reqwest::Client::new(),
            endpoints,
        }
    }

    /// Creates a client with explicit per-service endpoints.
    pub fn with_endpoints(endpoints: HashMap<ServiceKind, String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoints,
        }
    }

    fn endpoint(&self, service: ServiceKind) -> String {
        self.endpoints
            .get(&service)
            .cloned()
            .unwrap_or_else(|| format!("http://localhost:{}", service.default_port()))
    }
}

#[async_trait]
impl AnalyzerClient for HttpAnalyzerClient {
    async fn run_tools(
        &self,
        service: ServiceKind,
        model: &str,
        app_number: u32,
        tools: &[String],
        timeout: Duration,
    ) -> Result<RawAnalyzerResponse, AnalyzerError> {
        let request = AnalyzerRequest::analyze(service, model, app_number, tools);
        let url = format!("{}/analyze", self.endpoint(service));

        debug!(
            service = %service,
            model = %model,
            app_number = app_number,
            tools = tools.len(),
            "Dispatching analyzer request"
        );

        let send = self.http.post(&url).json(&request).send();
        let response = match tokio::time::timeout(timeout, send).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) if e.is_connect() => {
                return Err(AnalyzerError::Unreachable {
                    service,
                    message: e.to_string(),
                })
            }
            Ok(Err(e)) => return Err(AnalyzerError::Http(e)),
            Err(_) => return Err(AnalyzerError::Timeout(timeout)),
        };

        let status = response.status();
        if !status.is_success() {
            warn!(service = %service, status = status.as_u16(), "Analyzer rejected request");
            return Err(AnalyzerError::RequestFailed {
                service,
                status: status.as_u16(),
            });
        }

        let body = match tokio::time::timeout(timeout, response.json::<RawAnalyzerResponse>()).await
        {
            Ok(Ok(body)) => body,
            Ok(Err(e)) => return Err(AnalyzerError::ParseError(e.to_string())),
            Err(_) => return Err(AnalyzerError::Timeout(timeout)),
        };

        Ok(body)
    }

    async fn ping(&self, service: ServiceKind) -> bool {
        let url = format!("{}/health", self.endpoint(service));
        match self
            .http
            .get(&url)
            .timeout(Duration::from_secs(2))
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }
}
