//! Container lifecycle boundary.
//!
//! The orchestrator never builds images or composes stacks; generated
//! apps and analyzer services are pre-provisioned containers that only
//! need starting and stopping. `ContainerManager` is the seam the engine
//! depends on; `DockerContainerManager` drives a local Docker daemon via
//! bollard, and `NoopContainerManager` serves tests and the in-memory
//! backend.

use async_trait::async_trait;
use bollard::container::{InspectContainerOptions, StartContainerOptions, StopContainerOptions};
use bollard::Docker;
use thiserror::Error;
use tracing::{debug, warn};

use crate::analyzers::registry::ServiceKind;
use crate::error::{Classify, ErrorKind};

/// Errors that can occur during container operations.
#[derive(Debug, Error)]
pub enum ContainerError {
    /// The Docker daemon rejected or failed a start request.
    #[error("Failed to start container '{name}': {message}")]
    StartFailed { name: String, message: String },

    /// The Docker daemon rejected or failed a stop request.
    #[error("Failed to stop container '{name}': {message}")]
    StopFailed { name: String, message: String },

    /// The daemon itself is unreachable.
    #[error("Docker daemon not available: {0}")]
    DaemonUnavailable(String),

    /// Raw bollard error.
    #[error("Docker error: {0}")]
    Docker(#[from] bollard::errors::Error),
}

impl Classify for ContainerError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Transient
    }
}

/// Lifecycle operations the engine needs from the container layer.
#[async_trait]
pub trait ContainerManager: Send + Sync {
    /// Starts the container of a generated app so analyzers can reach it.
    async fn start_app(&self, model: &str, app_number: u32) -> Result<(), ContainerError>;

    /// Stops a generated app's container.
    async fn stop_app(&self, model: &str, app_number: u32) -> Result<(), ContainerError>;

    /// Makes sure the analyzer service container is up.
    async fn ensure_analyzer(&self, service: ServiceKind) -> Result<(), ContainerError>;

    /// Stops an analyzer service container.
    async fn stop_analyzer(&self, service: ServiceKind) -> Result<(), ContainerError>;
}

/// Deterministic container name for a generated app.
pub fn app_container_name(model: &str, app_number: u32) -> String {
    // Model slugs may carry registry separators that are invalid in
    // container names.
    let slug: String = model
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
        .collect();
    format!("{}-app-{}", slug.to_ascii_lowercase(), app_number)
}

/// Deterministic container name for an analyzer service.
pub fn analyzer_container_name(service: ServiceKind) -> String {
    format!("analyzer-{}", service.as_str())
}

/// Docker-backed manager over pre-provisioned containers.
pub struct DockerContainerManager {
    docker: Docker,
}

impl DockerContainerManager {
    /// Connects to the local Docker daemon.
    ///
    /// # Errors
    ///
    /// Returns `ContainerError::DaemonUnavailable` if no daemon answers.
    pub fn new() -> Result<Self, ContainerError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| ContainerError::DaemonUnavailable(e.to_string()))?;
        Ok(Self { docker })
    }

    /// Whether a named container is currently running.
    async fn is_running(&self, name: &str) -> Result<bool, ContainerError> {
        match self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
        {
            Ok(inspect) => Ok(inspect
                .state
                .and_then(|state| state.running)
                .unwrap_or(false)),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(ContainerError::Docker(e)),
        }
    }

    /// Starts a named container, tolerating "already started".
    async fn start(&self, name: &str) -> Result<(), ContainerError> {
        if self.is_running(name).await? {
            debug!(container = %name, "Container already running");
            return Ok(());
        }
        self.docker
            .start_container(name, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| ContainerError::StartFailed {
                name: name.to_string(),
                message: e.to_string(),
            })?;
        debug!(container = %name, "Container started");
        Ok(())
    }

    /// Stops a named container, tolerating "not running".
    async fn stop(&self, name: &str) -> Result<(), ContainerError> {
        match self
            .docker
            .stop_container(name, Some(StopContainerOptions { t: 10 }))
            .await
        {
            Ok(()) => {
                debug!(container = %name, "Container stopped");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304 | 404,
                ..
            }) => Ok(()),
            Err(e) => {
                warn!(container = %name, error = %e, "Container stop failed");
                Err(ContainerError::StopFailed {
                    name: name.to_string(),
                    message: e.to_string(),
                })
            }
        }
    }
}

#[async_trait]
impl ContainerManager for DockerContainerManager {
    async fn start_app(&self, model: &str, app_number: u32) -> Result<(), ContainerError> {
        self.start(&app_container_name(model, app_number)).await
    }

    async fn stop_app(&self, model: &str, app_number: u32) -> Result<(), ContainerError> {
        self.stop(&app_container_name(model, app_number)).await
    }

    async fn ensure_analyzer(&self, service: ServiceKind) -> Result<(), ContainerError> {
        self.start(&analyzer_container_name(service)).await
    }

    async fn stop_analyzer(&self, service: ServiceKind) -> Result<(), ContainerError> {
        self.stop(&analyzer_container_name(service)).await
    }
}

/// Manager that treats every container as already running. Used with the
/// in-memory backend and in tests.
#[derive(Debug, Default)]
pub struct NoopContainerManager;

#[async_trait]
impl ContainerManager for NoopContainerManager {
    async fn start_app(&self, _model: &str, _app_number: u32) -> Result<(), ContainerError> {
        Ok(())
    }

    async fn stop_app(&self, _model: &str, _app_number: u32) -> Result<(), ContainerError> {
        Ok(())
    }

    async fn ensure_analyzer(&self, _service: ServiceKind) -> Result<(), ContainerError> {
        Ok(())
    }

    async fn stop_analyzer(&self, _service: ServiceKind) -> Result<(), ContainerError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_container_name_sanitizes_slug() {
        assert_eq!(app_container_name("org/model:v1", 3), "org-model-v1-app-3");
        assert_eq!(app_container_name("Claude-X", 12), "claude-x-app-12");
    }

    #[test]
    fn test_analyzer_container_names() {
        assert_eq!(
            analyzer_container_name(ServiceKind::StaticAnalyzer),
            "analyzer-static-analyzer"
        );
        assert_eq!(
            analyzer_container_name(ServiceKind::PerformanceTester),
            "analyzer-performance-tester"
        );
    }

    #[test]
    fn test_container_error_is_transient() {
        let err = ContainerError::StartFailed {
            name: "m-app-1".to_string(),
            message: "no such container".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::Transient);
    }

    #[tokio::test]
    async fn test_noop_manager_accepts_everything() {
        let manager = NoopContainerManager;
        assert!(manager.start_app("m", 1).await.is_ok());
        assert!(manager.stop_app("m", 1).await.is_ok());
        assert!(manager.ensure_analyzer(ServiceKind::StaticAnalyzer).await.is_ok());
        assert!(manager.stop_analyzer(ServiceKind::StaticAnalyzer).await.is_ok());
    }
}
