//! The stage state machine that owns running pipelines.
//!
//! One `StageEngine` instance drives every pipeline in the process. Per
//! tick the loop first drains finished worker outcomes (recording them
//! under the pipeline's row lock), then advances each active pipeline:
//! submit new jobs up to the per-stage concurrency bound, and transition
//! stage when the completion predicate holds.
//!
//! The ordering contract that makes restarts safe: a job's dedup key is
//! inserted and the job index advanced *in the same commit*, before the
//! job is handed to a worker pool. A crash after that commit leaves the
//! key stranded in its active set; startup recovery parks stranded keys
//! in the retry bucket, from which the submit step re-dispatches them
//! with a bounded attempt budget.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::analyzers::client::AnalyzerClient;
use crate::analyzers::health::HealthCache;
use crate::analyzers::registry::{ServiceKind, ToolRegistry};
use crate::config::{
    CONTAINER_RETRY_DELAY, CONTAINER_STABILIZATION_DELAY, MAX_ANALYSIS_WORKERS,
    MAX_GENERATION_WORKERS, MAX_TASK_CREATION_RETRIES,
};
use crate::containers::ContainerManager;
use crate::generation::allocator::contention_backoff;
use crate::generation::GenerationWorker;
use crate::metrics::OrchestratorMetrics;
use crate::pipeline::execution::{
    GenerationJob, GenerationResult, MatrixConfig, PipelineExecution, PipelineStatus, Stage,
};
use crate::pipeline::store::{PipelineRowLock, PipelineStore};
use crate::pipeline::split_analysis_key;
use crate::tasks::store::TaskStore;
use crate::tasks::TaskExecutor;

use super::pool::WorkerPool;
use super::EngineError;

/// Outcome value produced by the generation pool.
pub struct GenerationJobOutcome {
    pipeline_id: Uuid,
    result: GenerationResult,
}

/// Outcome value produced by the analysis pool.
pub struct AnalysisJobOutcome {
    pipeline_id: Uuid,
    main_task_id: Uuid,
    status: Option<crate::tasks::TaskStatus>,
}

/// Timing knobs, defaulted from the module constants; tests shrink them.
#[derive(Debug, Clone)]
pub struct EngineTuning {
    /// Wait after starting an analyzer before the first probe.
    pub stabilization_delay: Duration,
    /// Minimum gap between analyzer health attempts for one service.
    pub container_retry_delay: Duration,
    /// Initial probe backoff inside one health attempt.
    pub health_probe_delay: Duration,
    /// Deadline of one health attempt.
    pub health_deadline: Duration,
}

impl Default for EngineTuning {
    fn default() -> Self {
        Self {
            stabilization_delay: CONTAINER_STABILIZATION_DELAY,
            container_retry_delay: CONTAINER_RETRY_DELAY,
            health_probe_delay: Duration::from_secs(1),
            health_deadline: Duration::from_secs(10),
        }
    }
}

/// Result of one analysis submission attempt.
enum SubmitResult {
    /// A main task (and its subtasks) now exists and is tracked.
    Created { main_id: Uuid },
    /// The job was already submitted; nothing to do.
    AlreadySubmitted,
    /// A transient failure; the job goes to the retry bucket.
    Transient(String),
}

/// The state machine driving all running pipelines.
pub struct StageEngine {
    pipeline_store: Arc<dyn PipelineStore>,
    task_store: Arc<dyn TaskStore>,
    generation_worker: Arc<GenerationWorker>,
    analyzer: Arc<dyn AnalyzerClient>,
    containers: Arc<dyn ContainerManager>,
    registry: Arc<ToolRegistry>,
    health: Arc<HealthCache>,
    executor: Arc<TaskExecutor>,
    metrics: Arc<OrchestratorMetrics>,
    tuning: EngineTuning,

    generation_pool: WorkerPool<GenerationJobOutcome>,
    analysis_pool: WorkerPool<AnalysisJobOutcome>,

    /// Main tasks with a live execution future in this process.
    executing_mains: Mutex<HashSet<Uuid>>,
    /// Analyzers this process started, per pipeline, for teardown.
    started_analyzers: Mutex<HashMap<Uuid, BTreeSet<ServiceKind>>>,
    /// Last failed health attempt per service, gating re-probes.
    health_attempts: Mutex<HashMap<ServiceKind, Instant>>,
}

impl StageEngine {
    /// Creates the engine over its injected collaborators.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pipeline_store: Arc<dyn PipelineStore>,
        task_store: Arc<dyn TaskStore>,
        generation_worker: Arc<GenerationWorker>,
        analyzer: Arc<dyn AnalyzerClient>,
        containers: Arc<dyn ContainerManager>,
        registry: Arc<ToolRegistry>,
        health: Arc<HealthCache>,
        executor: Arc<TaskExecutor>,
        metrics: Arc<OrchestratorMetrics>,
    ) -> Self {
        Self {
            pipeline_store,
            task_store,
            generation_worker,
            analyzer,
            containers,
            registry,
            health,
            executor,
            metrics,
            tuning: EngineTuning::default(),
            generation_pool: WorkerPool::new("generation", MAX_GENERATION_WORKERS),
            analysis_pool: WorkerPool::new("analysis", MAX_ANALYSIS_WORKERS),
            executing_mains: Mutex::new(HashSet::new()),
            started_analyzers: Mutex::new(HashMap::new()),
            health_attempts: Mutex::new(HashMap::new()),
        }
    }

    /// Overrides timing knobs (tests).
    pub fn with_tuning(mut self, tuning: EngineTuning) -> Self {
        self.tuning = tuning;
        self
    }

    /// Drains finished worker outcomes and records them. Recording
    /// happens for any pipeline, including cancelled ones: submitted
    /// work is never aborted, only its results are no longer acted on.
    pub async fn drain_outcomes(&self) {
        for outcome in self.generation_pool.drain() {
            if let Err(e) = self.record_generation_outcome(&outcome).await {
                error!(
                    pipeline_id = %outcome.pipeline_id,
                    error = %e,
                    "Failed to record generation outcome"
                );
            }
        }

        for outcome in self.analysis_pool.drain() {
            self.executing_mains
                .lock()
                .expect("executing set poisoned")
                .remove(&outcome.main_task_id);
            match outcome.status {
                Some(status) => {
                    self.metrics
                        .analysis_tasks
                        .with_label_values(&[status.as_str()])
                        .inc();
                    debug!(
                        pipeline_id = %outcome.pipeline_id,
                        task_id = %outcome.main_task_id,
                        status = %status,
                        "Analysis execution finished"
                    );
                }
                None => warn!(
                    pipeline_id = %outcome.pipeline_id,
                    task_id = %outcome.main_task_id,
                    "Analysis execution ended without a status"
                ),
            }
        }
    }

    /// Records one generation outcome under the pipeline's row lock.
    async fn record_generation_outcome(
        &self,
        outcome: &GenerationJobOutcome,
    ) -> Result<(), EngineError> {
        let mut lock = self.pipeline_store.lock(outcome.pipeline_id).await?;
        let appended = lock.pipeline().progress.generation.record(outcome.result.clone());
        if appended {
            let label = if outcome.result.success { "success" } else { "failure" };
            self.metrics.generation_jobs.with_label_values(&[label]).inc();
            info!(
                pipeline_id = %outcome.pipeline_id,
                job_index = outcome.result.job_index,
                model = %outcome.result.model,
                template = %outcome.result.template,
                success = outcome.result.success,
                "Recorded generation result"
            );
            lock.commit().await?;
        }
        Ok(())
    }

    /// Advances one pipeline by a single step of its stage machine.
    pub async fn advance(&self, snapshot: &PipelineExecution) -> Result<(), EngineError> {
        if snapshot.status == PipelineStatus::Pending {
            self.pick_up(snapshot.id).await?;
        }

        let pipeline = self.pipeline_store.load(snapshot.id).await?;
        if pipeline.status != PipelineStatus::Running {
            return Ok(());
        }
        if let Err(message) = pipeline.validate_progress() {
            error!(pipeline_id = %pipeline.id, message = %message, "Progress document corrupt");
            self.fail_pipeline(pipeline.id, &message).await?;
            return Ok(());
        }

        match pipeline.current_stage {
            Stage::Generation => self.advance_generation(pipeline.id).await,
            Stage::Analysis => {
                let services = match self.registry.services_for(&pipeline.config.tools) {
                    Ok(services) => services,
                    Err(e) => {
                        self.fail_pipeline(pipeline.id, &e.to_string()).await?;
                        return Ok(());
                    }
                };
                if !pipeline.progress.analysis.is_complete()
                    && !self.ensure_analyzers(pipeline.id, &services).await
                {
                    // Not healthy yet; stay running, retry next tick.
                    return Ok(());
                }
                self.advance_analysis(pipeline.id).await
            }
            Stage::Done => Ok(()),
        }
    }

    /// Transitions a pending pipeline to running.
    async fn pick_up(&self, pipeline_id: Uuid) -> Result<(), EngineError> {
        let mut lock = self.pipeline_store.lock(pipeline_id).await?;
        if lock.pipeline().status == PipelineStatus::Pending {
            lock.pipeline().status = PipelineStatus::Running;
            info!(pipeline_id = %pipeline_id, "Picked up pipeline");
            self.metrics.running_pipelines.inc();
            lock.commit().await?;
        }
        Ok(())
    }

    /// Marks a pipeline failed after a fatal error.
    pub async fn fail_pipeline(&self, pipeline_id: Uuid, reason: &str) -> Result<(), EngineError> {
        let mut lock = self.pipeline_store.lock(pipeline_id).await?;
        if !lock.pipeline().status.is_terminal() {
            lock.pipeline().status = PipelineStatus::Failed;
            error!(pipeline_id = %pipeline_id, reason = %reason, "Pipeline failed");
            self.metrics.running_pipelines.dec();
            lock.commit().await?;
        }
        Ok(())
    }

    // =========================================================================
    // Generation stage
    // =========================================================================

    async fn advance_generation(&self, pipeline_id: Uuid) -> Result<(), EngineError> {
        let mut lock = self.pipeline_store.lock(pipeline_id).await?;
        if lock.pipeline().status != PipelineStatus::Running
            || lock.pipeline().current_stage != Stage::Generation
        {
            return Ok(());
        }

        if lock.pipeline().progress.generation.is_complete() {
            return self.finish_generation(lock).await;
        }

        let mut to_submit: Vec<GenerationJob> = Vec::new();
        {
            let pipeline = lock.pipeline();
            let mut slots = pipeline
                .config
                .max_concurrent_generation
                .saturating_sub(pipeline.progress.generation.in_flight_keys.len());

            // Retry bucket first: interrupted jobs re-dispatch before new
            // indices are consumed.
            let bucket: Vec<(String, u32)> = pipeline
                .progress
                .generation
                .retryable_keys
                .iter()
                .map(|(k, a)| (k.clone(), *a))
                .collect();
            for (key, attempts) in bucket {
                if slots == 0 {
                    break;
                }
                pipeline.progress.generation.retryable_keys.remove(&key);
                let job = match generation_job_for_key(&pipeline.config, &key) {
                    Some(job) => job,
                    None => continue,
                };
                if pipeline.progress.generation.has_result_for(job.job_index) {
                    continue;
                }
                if attempts >= MAX_TASK_CREATION_RETRIES {
                    warn!(
                        pipeline_id = %pipeline_id,
                        key = %key,
                        attempts,
                        "Generation retry budget exhausted"
                    );
                    pipeline.progress.generation.record(GenerationResult::failure(
                        job.job_index,
                        &job.model,
                        &job.template,
                        "retry budget exhausted",
                    ));
                    self.metrics.generation_jobs.with_label_values(&["failure"]).inc();
                    continue;
                }
                pipeline.progress.generation.in_flight_keys.insert(key);
                to_submit.push(job);
                slots -= 1;
            }

            // Then fresh jobs, consuming indices in strictly increasing
            // order.
            while slots > 0 && pipeline.current_job_index < pipeline.progress.generation.total {
                let job = match pipeline.config.generation_job(pipeline.current_job_index) {
                    Some(job) => job,
                    None => break,
                };
                let key = job.key();
                let generation = &pipeline.progress.generation;
                if generation.in_flight_keys.contains(&key)
                    || generation.retryable_keys.contains_key(&key)
                    || generation.has_result_for(job.job_index)
                {
                    pipeline.current_job_index += 1;
                    continue;
                }
                pipeline.progress.generation.in_flight_keys.insert(key);
                pipeline.current_job_index += 1;
                to_submit.push(job);
                slots -= 1;
            }
        }

        // Commit the reservation before any job reaches a worker: a crash
        // past this point leaves keys to be recovered, never duplicated.
        lock.commit().await?;

        for job in to_submit {
            let worker = Arc::clone(&self.generation_worker);
            debug!(
                pipeline_id = %pipeline_id,
                job_index = job.job_index,
                model = %job.model,
                template = %job.template,
                "Submitting generation job"
            );
            self.generation_pool.submit(async move {
                let result = worker.run(job).await;
                GenerationJobOutcome {
                    pipeline_id,
                    result,
                }
            });
        }

        Ok(())
    }

    /// Transitions generation -> analysis.
    async fn finish_generation(
        &self,
        mut lock: Box<dyn PipelineRowLock>,
    ) -> Result<(), EngineError> {
        let pipeline = lock.pipeline();
        pipeline.progress.generation.in_flight_keys.clear();
        pipeline.current_job_index = 0;
        pipeline.current_stage = Stage::Analysis;
        // One analysis job per successful generation; with no tools
        // configured the stage is empty and ends immediately.
        pipeline.progress.analysis.total = if pipeline.config.tools.is_empty() {
            0
        } else {
            pipeline.progress.generation.completed
        };
        let id = pipeline.id;
        let total = pipeline.progress.analysis.total;
        lock.commit().await?;

        // First analysis attempt starts from fresh reachability data.
        self.health.invalidate();

        info!(
            pipeline_id = %id,
            analysis_total = total,
            "Generation stage complete, entering analysis"
        );
        Ok(())
    }

    // =========================================================================
    // Analysis stage
    // =========================================================================

    /// Makes sure every required analyzer answers its health probe.
    /// Returns `false` to retry on a later tick.
    async fn ensure_analyzers(&self, pipeline_id: Uuid, services: &[ServiceKind]) -> bool {
        for service in services {
            if self.health.is_healthy(*service) {
                continue;
            }

            // Respect the inter-attempt spacing for services that just
            // failed a probe.
            {
                let attempts = self.health_attempts.lock().expect("health attempts poisoned");
                if let Some(last) = attempts.get(service) {
                    if last.elapsed() < self.tuning.container_retry_delay {
                        return false;
                    }
                }
            }

            if let Err(e) = self.containers.ensure_analyzer(*service).await {
                warn!(service = %service, error = %e, "Analyzer container start failed");
                self.note_health_attempt(*service);
                return false;
            }
            self.track_started_analyzer(pipeline_id, *service);

            if !self.tuning.stabilization_delay.is_zero() {
                tokio::time::sleep(self.tuning.stabilization_delay).await;
            }

            let healthy = self
                .health
                .ensure_healthy(
                    self.analyzer.as_ref(),
                    *service,
                    self.tuning.health_probe_delay,
                    self.tuning.health_deadline,
                )
                .await;
            if !healthy {
                warn!(service = %service, "Analyzer not healthy, retrying on a later tick");
                self.note_health_attempt(*service);
                return false;
            }
        }
        true
    }

    fn note_health_attempt(&self, service: ServiceKind) {
        self.health_attempts
            .lock()
            .expect("health attempts poisoned")
            .insert(service, Instant::now());
    }

    fn track_started_analyzer(&self, pipeline_id: Uuid, service: ServiceKind) {
        self.started_analyzers
            .lock()
            .expect("started analyzers poisoned")
            .entry(pipeline_id)
            .or_default()
            .insert(service);
    }

    async fn advance_analysis(&self, pipeline_id: Uuid) -> Result<(), EngineError> {
        let mut lock = self.pipeline_store.lock(pipeline_id).await?;
        if lock.pipeline().status != PipelineStatus::Running
            || lock.pipeline().current_stage != Stage::Analysis
        {
            return Ok(());
        }

        // Drain: count freshly-terminal mains exactly once.
        let unaccounted: Vec<Uuid> = {
            let analysis = &lock.pipeline().progress.analysis;
            analysis
                .main_task_ids
                .iter()
                .filter(|id| !analysis.drained_task_ids.contains(id))
                .cloned()
                .collect()
        };
        for main_id in &unaccounted {
            if let Some(status) = self.task_store.terminal_state(*main_id).await? {
                let analysis = &mut lock.pipeline().progress.analysis;
                analysis.drained_task_ids.insert(*main_id);
                if status.counts_completed() {
                    analysis.completed += 1;
                } else {
                    analysis.failed += 1;
                }
                info!(
                    pipeline_id = %pipeline_id,
                    task_id = %main_id,
                    status = %status,
                    completed = analysis.completed,
                    failed = analysis.failed,
                    "Drained terminal main task"
                );
            }
        }

        if lock.pipeline().progress.analysis.is_complete() {
            return self.finish_analysis(lock).await;
        }

        // Submit up to the per-pipeline bound.
        let groups = match self.registry.group_by_service(&lock.pipeline().config.tools) {
            Ok(groups) => groups,
            Err(e) => {
                drop(lock);
                self.fail_pipeline(pipeline_id, &e.to_string()).await?;
                return Ok(());
            }
        };

        let mut newly_created: Vec<Uuid> = Vec::new();
        {
            let in_flight = {
                let analysis = &lock.pipeline().progress.analysis;
                analysis.main_task_ids.len() - analysis.drained_task_ids.len()
            };
            let mut slots = lock
                .pipeline()
                .config
                .max_concurrent_analysis
                .saturating_sub(in_flight);

            // Retry bucket first.
            let bucket: Vec<(String, u32)> = lock
                .pipeline()
                .progress
                .analysis
                .retryable_apps
                .iter()
                .map(|(k, a)| (k.clone(), *a))
                .collect();
            for (key, attempts) in bucket {
                if slots == 0 {
                    break;
                }
                if attempts >= MAX_TASK_CREATION_RETRIES {
                    let analysis = &mut lock.pipeline().progress.analysis;
                    analysis.retryable_apps.remove(&key);
                    analysis.failed += 1;
                    warn!(
                        pipeline_id = %pipeline_id,
                        key = %key,
                        attempts,
                        "Analysis retry budget exhausted, counting job failed"
                    );
                    continue;
                }
                let (model, app_number) = match split_analysis_key(&key) {
                    Some(parts) => parts,
                    None => {
                        lock.pipeline().progress.analysis.retryable_apps.remove(&key);
                        continue;
                    }
                };
                match self
                    .try_submit_analysis(&mut *lock, &model, app_number, &key, &groups)
                    .await?
                {
                    SubmitResult::Created { main_id } => {
                        newly_created.push(main_id);
                        slots -= 1;
                    }
                    SubmitResult::AlreadySubmitted => {}
                    SubmitResult::Transient(message) => {
                        let attempts = lock.mark_job_retryable(Stage::Analysis, &key);
                        self.metrics.retries_parked.with_label_values(&["analysis"]).inc();
                        warn!(
                            pipeline_id = %pipeline_id,
                            key = %key,
                            attempts,
                            message = %message,
                            "Analysis submission parked for retry"
                        );
                    }
                }
            }

            // Then fresh jobs from the ordered work list.
            while slots > 0 && lock.pipeline().current_job_index < lock.pipeline().analysis_job_count()
            {
                let index = lock.pipeline().current_job_index;
                let job = match lock.pipeline().analysis_job(index) {
                    Some(job) => job,
                    None => break,
                };
                if !job.generation_success {
                    lock.advance_job_index();
                    continue;
                }
                let key = match job.key() {
                    Some(key) => key,
                    None => {
                        lock.advance_job_index();
                        continue;
                    }
                };
                {
                    let analysis = &lock.pipeline().progress.analysis;
                    if analysis.submitted_apps.contains(&key)
                        || analysis.retryable_apps.contains_key(&key)
                    {
                        lock.advance_job_index();
                        continue;
                    }
                }
                let app_number = job.app_number.unwrap_or_default();
                match self
                    .try_submit_analysis(&mut *lock, &job.model, app_number, &key, &groups)
                    .await?
                {
                    SubmitResult::Created { main_id } => {
                        newly_created.push(main_id);
                        lock.advance_job_index();
                        slots -= 1;
                    }
                    SubmitResult::AlreadySubmitted => {
                        lock.advance_job_index();
                    }
                    SubmitResult::Transient(message) => {
                        let attempts = lock.mark_job_retryable(Stage::Analysis, &key);
                        self.metrics.retries_parked.with_label_values(&["analysis"]).inc();
                        warn!(
                            pipeline_id = %pipeline_id,
                            key = %key,
                            attempts,
                            message = %message,
                            "Analysis submission parked for retry"
                        );
                        lock.advance_job_index();
                    }
                }
            }
        }

        // Mains needing an execution future: fresh creations plus
        // non-terminal mains found after a restart.
        let to_execute: Vec<Uuid> = {
            let analysis = &lock.pipeline().progress.analysis;
            analysis
                .main_task_ids
                .iter()
                .filter(|id| !analysis.drained_task_ids.contains(id))
                .cloned()
                .collect()
        };

        lock.commit().await?;

        for main_id in to_execute {
            self.submit_execution(pipeline_id, main_id);
        }
        // `newly_created` is a subset of `to_execute`; nothing further to
        // do with it beyond logging.
        if !newly_created.is_empty() {
            debug!(
                pipeline_id = %pipeline_id,
                created = newly_created.len(),
                "Created main analysis tasks"
            );
        }

        Ok(())
    }

    /// Submits an execution future for a main task unless one is already
    /// live in this process.
    fn submit_execution(&self, pipeline_id: Uuid, main_id: Uuid) {
        {
            let mut executing = self.executing_mains.lock().expect("executing set poisoned");
            if !executing.insert(main_id) {
                return;
            }
        }
        let executor = Arc::clone(&self.executor);
        self.analysis_pool.submit(async move {
            let status = match executor.execute_main(main_id).await {
                Ok(status) => Some(status),
                Err(e) => {
                    error!(task_id = %main_id, error = %e, "Main task execution failed");
                    None
                }
            };
            AnalysisJobOutcome {
                pipeline_id,
                main_task_id: main_id,
                status,
            }
        });
    }

    /// One analysis submission: recheck dedup under the row lock, start
    /// the app container, create main + subtasks, track the IDs.
    async fn try_submit_analysis(
        &self,
        lock: &mut dyn PipelineRowLock,
        model: &str,
        app_number: u32,
        key: &str,
        groups: &[(ServiceKind, Vec<String>)],
    ) -> Result<SubmitResult, EngineError> {
        let pipeline_id = lock.pipeline().id;

        if lock.pipeline().progress.analysis.submitted_apps.contains(key) {
            return Ok(SubmitResult::AlreadySubmitted);
        }

        // Belt and braces: a main task may exist from a run that crashed
        // between task creation and the progress commit. Adopt it instead
        // of creating a duplicate.
        if let Some(existing) = self
            .task_store
            .find_main_task(pipeline_id, model, app_number)
            .await?
        {
            let subtask_ids: Vec<Uuid> = self
                .task_store
                .subtasks_of(existing.task_id)
                .await?
                .into_iter()
                .map(|t| t.task_id)
                .collect();
            let analysis = &mut lock.pipeline().progress.analysis;
            if !analysis.main_task_ids.contains(&existing.task_id) {
                analysis.main_task_ids.push(existing.task_id);
                for id in subtask_ids {
                    if !analysis.subtask_ids.contains(&id) {
                        analysis.subtask_ids.push(id);
                    }
                }
            }
            analysis.mark_submitted(key);
            info!(
                pipeline_id = %pipeline_id,
                task_id = %existing.task_id,
                key = %key,
                "Adopted pre-existing main task"
            );
            return Ok(SubmitResult::Created {
                main_id: existing.task_id,
            });
        }

        if let Err(e) = self.containers.start_app(model, app_number).await {
            return Ok(SubmitResult::Transient(format!("app container: {}", e)));
        }

        let mut last_error = String::new();
        for attempt in 0..MAX_TASK_CREATION_RETRIES {
            match self
                .task_store
                .create_main_with_subtasks(pipeline_id, model, app_number, groups)
                .await
            {
                Ok(created) => {
                    let analysis = &mut lock.pipeline().progress.analysis;
                    analysis.main_task_ids.push(created.main_id);
                    analysis.subtask_ids.extend(created.subtask_ids.iter());
                    analysis.mark_submitted(key);
                    info!(
                        pipeline_id = %pipeline_id,
                        task_id = %created.main_id,
                        subtasks = created.subtask_ids.len(),
                        model = %model,
                        app_number,
                        "Created main analysis task"
                    );
                    return Ok(SubmitResult::Created {
                        main_id: created.main_id,
                    });
                }
                Err(e) if e.is_unique_violation() => {
                    last_error = e.to_string();
                    tokio::time::sleep(contention_backoff(attempt)).await;
                }
                Err(e) => return Err(EngineError::Store(e)),
            }
        }
        Ok(SubmitResult::Transient(format!(
            "task creation contention: {}",
            last_error
        )))
    }

    /// Transitions analysis -> done, tearing down containers.
    async fn finish_analysis(&self, mut lock: Box<dyn PipelineRowLock>) -> Result<(), EngineError> {
        let pipeline = lock.pipeline();
        pipeline.current_stage = Stage::Done;
        // Per-task failures are surfaced through the progress counters;
        // only system-level errors fail a pipeline.
        pipeline.status = PipelineStatus::Completed;
        let id = pipeline.id;
        let completed = pipeline.progress.analysis.completed;
        let failed = pipeline.progress.analysis.failed;
        let apps = pipeline.touched_apps();
        lock.commit().await?;

        self.metrics.running_pipelines.dec();

        for (model, app_number) in apps {
            if let Err(e) = self.containers.stop_app(&model, app_number).await {
                warn!(model = %model, app_number, error = %e, "App container stop failed");
            }
        }
        let started = self
            .started_analyzers
            .lock()
            .expect("started analyzers poisoned")
            .remove(&id)
            .unwrap_or_default();
        for service in started {
            if let Err(e) = self.containers.stop_analyzer(service).await {
                warn!(service = %service, error = %e, "Analyzer stop failed");
            }
        }

        info!(
            pipeline_id = %id,
            completed,
            failed,
            "Pipeline completed"
        );
        Ok(())
    }

    // =========================================================================
    // Shutdown and recovery
    // =========================================================================

    /// Parks every in-flight generation key of running pipelines in the
    /// retry bucket. Called on graceful shutdown for jobs that missed the
    /// drain deadline, and on startup to recover keys stranded by a
    /// crash. Analysis needs no equivalent: submitted mains are durable
    /// in `submitted_apps`/`main_task_ids` and resume by re-execution.
    pub async fn park_in_flight_generation(&self) -> Result<(), EngineError> {
        for pipeline in self.pipeline_store.list_running().await? {
            if pipeline.current_stage != Stage::Generation
                || pipeline.progress.generation.in_flight_keys.is_empty()
            {
                continue;
            }
            let mut lock = self.pipeline_store.lock(pipeline.id).await?;
            let keys: Vec<String> = lock
                .pipeline()
                .progress
                .generation
                .in_flight_keys
                .iter()
                .cloned()
                .collect();
            for key in keys {
                let attempts = lock.mark_job_retryable(Stage::Generation, &key);
                self.metrics.retries_parked.with_label_values(&["generation"]).inc();
                info!(
                    pipeline_id = %pipeline.id,
                    key = %key,
                    attempts,
                    "Parked in-flight generation job for retry"
                );
            }
            lock.commit().await?;
        }
        Ok(())
    }

    /// Waits for both pools to go idle, up to `timeout`.
    pub async fn wait_for_workers(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        let generation_idle = self.generation_pool.wait_idle(timeout).await;
        let remaining = deadline
            .checked_duration_since(tokio::time::Instant::now())
            .unwrap_or(Duration::ZERO);
        let analysis_idle = self.analysis_pool.wait_idle(remaining).await;
        generation_idle && analysis_idle
    }

    /// Closes both pools; queued-but-unstarted work is dropped.
    pub fn close_pools(&self) {
        self.generation_pool.close();
        self.analysis_pool.close();
    }

    /// The pipeline store this engine drives.
    pub fn pipeline_store(&self) -> &Arc<dyn PipelineStore> {
        &self.pipeline_store
    }

    /// Exported metrics.
    pub fn metrics(&self) -> &Arc<OrchestratorMetrics> {
        &self.metrics
    }
}

/// Reconstructs the generation job for a dedup key by scanning the
/// frozen matrix. Keys always originate from the matrix, so a miss means
/// the key is stale and can be dropped.
fn generation_job_for_key(config: &MatrixConfig, key: &str) -> Option<GenerationJob> {
    (0..config.generation_total())
        .filter_map(|index| config.generation_job(index))
        .find(|job| job.key() == key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generation_job_for_key_round_trips() {
        let config = MatrixConfig::new(
            vec!["M1".to_string(), "M2".to_string()],
            vec!["T1".to_string(), "T2".to_string()],
            Vec::new(),
        );
        let job = config.generation_job(3).expect("job");
        let found = generation_job_for_key(&config, &job.key()).expect("found");
        assert_eq!(found, job);

        assert!(generation_job_for_key(&config, "nope|nothing").is_none());
    }

    #[test]
    fn test_default_tuning_matches_constants() {
        let tuning = EngineTuning::default();
        assert_eq!(tuning.stabilization_delay, CONTAINER_STABILIZATION_DELAY);
        assert_eq!(tuning.container_retry_delay, CONTAINER_RETRY_DELAY);
    }
}
