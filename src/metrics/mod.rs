//! Prometheus metrics for the orchestrator.

use prometheus::{Encoder, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

/// Counters and gauges exported by the orchestrator process.
pub struct OrchestratorMetrics {
    registry: Registry,
    /// Generation job outcomes, labeled by result.
    pub generation_jobs: IntCounterVec,
    /// Main analysis task outcomes, labeled by terminal status.
    pub analysis_tasks: IntCounterVec,
    /// Pipelines currently in `running` state.
    pub running_pipelines: IntGauge,
    /// Jobs parked in a retry bucket.
    pub retries_parked: IntCounterVec,
}

impl OrchestratorMetrics {
    /// Creates and registers all metrics.
    ///
    /// # Errors
    ///
    /// Returns `prometheus::Error` on duplicate registration.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let generation_jobs = IntCounterVec::new(
            Opts::new("appforge_generation_jobs_total", "Generation job outcomes"),
            &["result"],
        )?;
        let analysis_tasks = IntCounterVec::new(
            Opts::new("appforge_analysis_tasks_total", "Main analysis task outcomes"),
            &["status"],
        )?;
        let running_pipelines = IntGauge::new(
            "appforge_running_pipelines",
            "Pipelines currently running",
        )?;
        let retries_parked = IntCounterVec::new(
            Opts::new("appforge_retries_parked_total", "Jobs parked for retry"),
            &["stage"],
        )?;

        registry.register(Box::new(generation_jobs.clone()))?;
        registry.register(Box::new(analysis_tasks.clone()))?;
        registry.register(Box::new(running_pipelines.clone()))?;
        registry.register(Box::new(retries_parked.clone()))?;

        Ok(Self {
            registry,
            generation_jobs,
            analysis_tasks,
            running_pipelines,
            retries_parked,
        })
    }

    /// Renders the registry in the Prometheus text format.
    pub fn gather(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if encoder
            .encode(&self.registry.gather(), &mut buffer)
            .is_err()
        {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}
