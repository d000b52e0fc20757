//! Execution of one generation job.

use std::sync::Arc;

use tracing::{info, warn};

use crate::pipeline::execution::{GenerationJob, GenerationResult};

use super::{AppNumberAllocator, GenerationService};

/// Runs generation jobs: reserve an app number, call the external
/// service, report the outcome. Stateless beyond its dependencies, so
/// one worker value is shared by the whole pool.
pub struct GenerationWorker {
    service: Arc<dyn GenerationService>,
    allocator: Arc<dyn AppNumberAllocator>,
}

impl GenerationWorker {
    /// Creates a worker over the injected collaborators.
    pub fn new(service: Arc<dyn GenerationService>, allocator: Arc<dyn AppNumberAllocator>) -> Self {
        Self { service, allocator }
    }

    /// Executes one job to completion. Never panics and never errors:
    /// every failure mode becomes an unsuccessful `GenerationResult`.
    pub async fn run(&self, job: GenerationJob) -> GenerationResult {
        let app_number = match self.allocator.reserve(&job.model).await {
            Ok(app_number) => app_number,
            Err(e) => {
                warn!(
                    model = %job.model,
                    template = %job.template,
                    error = %e,
                    "App number reservation failed"
                );
                return GenerationResult::failure(
                    job.job_index,
                    &job.model,
                    &job.template,
                    format!("app number reservation failed: {}", e),
                );
            }
        };

        let outcome = self
            .service
            .generate_full_app(&job.model, &job.template, app_number)
            .await;

        if outcome.success {
            info!(
                model = %job.model,
                template = %job.template,
                app_number,
                "Generation succeeded"
            );
            GenerationResult::success(job.job_index, &job.model, &job.template, app_number)
        } else {
            let error = outcome
                .error
                .unwrap_or_else(|| "generation failed without detail".to_string());
            warn!(
                model = %job.model,
                template = %job.template,
                app_number,
                error = %error,
                "Generation failed"
            );
            GenerationResult::failure(job.job_index, &job.model, &job.template, error)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    use crate::generation::{AllocatorError, BuildOutcome};

    struct SequentialAllocator {
        next: AtomicU32,
    }

    #[async_trait]
    impl AppNumberAllocator for SequentialAllocator {
        async fn reserve(&self, _model: &str) -> Result<u32, AllocatorError> {
            Ok(self.next.fetch_add(1, Ordering::SeqCst))
        }
    }

    struct ExhaustedAllocator;

    #[async_trait]
    impl AppNumberAllocator for ExhaustedAllocator {
        async fn reserve(&self, model: &str) -> Result<u32, AllocatorError> {
            Err(AllocatorError::Contention {
                model: model.to_string(),
                attempts: 3,
            })
        }
    }

    struct FixedService {
        outcome: BuildOutcome,
    }

    #[async_trait]
    impl GenerationService for FixedService {
        async fn generate_full_app(
            &self,
            _model: &str,
            _template: &str,
            _app_number: u32,
        ) -> BuildOutcome {
            self.outcome.clone()
        }
    }

    fn job() -> GenerationJob {
        GenerationJob {
            job_index: 2,
            model: "M1".to_string(),
            template: "T1".to_string(),
        }
    }

    #[tokio::test]
    async fn test_successful_job_records_app_number() {
        let worker = GenerationWorker::new(
            Arc::new(FixedService {
                outcome: BuildOutcome::success(),
            }),
            Arc::new(SequentialAllocator {
                next: AtomicU32::new(7),
            }),
        );

        let result = worker.run(job()).await;
        assert!(result.success);
        assert_eq!(result.app_number, Some(7));
        assert_eq!(result.job_index, 2);
        assert!(result.error.is_none());
    }

    #[tokio::test]
    async fn test_service_failure_becomes_failed_result() {
        let worker = GenerationWorker::new(
            Arc::new(FixedService {
                outcome: BuildOutcome::failure("model refused"),
            }),
            Arc::new(SequentialAllocator {
                next: AtomicU32::new(1),
            }),
        );

        let result = worker.run(job()).await;
        assert!(!result.success);
        assert!(result.app_number.is_none());
        assert_eq!(result.error.as_deref(), Some("model refused"));
    }

    #[tokio::test]
    async fn test_allocator_exhaustion_becomes_failed_result() {
        let worker = GenerationWorker::new(
            Arc::new(FixedService {
                outcome: BuildOutcome::success(),
            }),
            Arc::new(ExhaustedAllocator),
        );

        let result = worker.run(job()).await;
        assert!(!result.success);
        let error = result.error.expect("error recorded");
        assert!(error.contains("reservation failed"));
    }
}
