//! Durable pipeline execution model.
//!
//! A `PipelineExecution` is the persistent root record for one run of the
//! two-stage matrix: a generation stage over (model, template) pairs
//! followed by an analysis stage over the (model, app_number) pairs the
//! generation stage produced. The `progress` document carries everything
//! the engine needs to resume deterministically after a restart: append-only
//! generation results, the deduplication sets, and the retry buckets.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::{DEFAULT_MAX_CONCURRENT_ANALYSIS, DEFAULT_MAX_CONCURRENT_GENERATION};

/// Lifecycle state of a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    /// Created by an external caller; not yet picked up.
    Pending,
    /// Owned and driven by the orchestrator.
    Running,
    /// Both stages finished. Per-task failures do not prevent this state.
    Completed,
    /// A fatal (system-level) error stopped the pipeline.
    Failed,
    /// Externally cancelled; in-flight work was drained, not aborted.
    Cancelled,
}

impl PipelineStatus {
    /// Whether this status is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PipelineStatus::Completed | PipelineStatus::Failed | PipelineStatus::Cancelled
        )
    }

    /// Stable textual form used in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStatus::Pending => "pending",
            PipelineStatus::Running => "running",
            PipelineStatus::Completed => "completed",
            PipelineStatus::Failed => "failed",
            PipelineStatus::Cancelled => "cancelled",
        }
    }

    /// Parses the database textual form.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(PipelineStatus::Pending),
            "running" => Some(PipelineStatus::Running),
            "completed" => Some(PipelineStatus::Completed),
            "failed" => Some(PipelineStatus::Failed),
            "cancelled" => Some(PipelineStatus::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Active stage of a running pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Building applications from (model, template) pairs.
    Generation,
    /// Fanning generated apps out to analyzer services.
    Analysis,
    /// Both stages finished.
    Done,
}

impl Stage {
    /// Stable textual form used in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Generation => "generation",
            Stage::Analysis => "analysis",
            Stage::Done => "done",
        }
    }

    /// Parses the database textual form.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "generation" => Some(Stage::Generation),
            "analysis" => Some(Stage::Analysis),
            "done" => Some(Stage::Done),
            _ => None,
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Frozen input of a pipeline: the job matrices and concurrency bounds.
///
/// The orderings of `models`, `templates` and `tools` are contracts; job
/// indices are derived from them, so a restart continues deterministically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatrixConfig {
    /// Model slugs, outer loop of the generation matrix.
    pub models: Vec<String>,
    /// Template identifiers, inner loop of the generation matrix.
    pub templates: Vec<String>,
    /// Canonical analyzer tool names run against every generated app.
    pub tools: Vec<String>,
    /// Per-pipeline bound on concurrent generation jobs.
    pub max_concurrent_generation: usize,
    /// Per-pipeline bound on concurrent analysis jobs.
    pub max_concurrent_analysis: usize,
}

impl MatrixConfig {
    /// Creates a config with default concurrency bounds.
    pub fn new(models: Vec<String>, templates: Vec<String>, tools: Vec<String>) -> Self {
        Self {
            models,
            templates,
            tools,
            max_concurrent_generation: DEFAULT_MAX_CONCURRENT_GENERATION,
            max_concurrent_analysis: DEFAULT_MAX_CONCURRENT_ANALYSIS,
        }
    }

    /// Sets the generation concurrency bound.
    pub fn with_max_concurrent_generation(mut self, bound: usize) -> Self {
        self.max_concurrent_generation = bound.max(1);
        self
    }

    /// Sets the analysis concurrency bound.
    pub fn with_max_concurrent_analysis(mut self, bound: usize) -> Self {
        self.max_concurrent_analysis = bound.max(1);
        self
    }

    /// Total number of generation jobs in the matrix.
    pub fn generation_total(&self) -> usize {
        self.models.len() * self.templates.len()
    }

    /// The generation job at `job_index`, or `None` past the end.
    ///
    /// Ordering contract: outer loop models, inner loop templates.
    pub fn generation_job(&self, job_index: usize) -> Option<GenerationJob> {
        if self.templates.is_empty() || job_index >= self.generation_total() {
            return None;
        }
        let model = self.models[job_index / self.templates.len()].clone();
        let template = self.templates[job_index % self.templates.len()].clone();
        Some(GenerationJob {
            job_index,
            model,
            template,
        })
    }
}

/// One element of the generation stage's ordered work list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationJob {
    /// Position in the deterministic job ordering.
    pub job_index: usize,
    /// Model slug.
    pub model: String,
    /// Template identifier.
    pub template: String,
}

impl GenerationJob {
    /// Deduplication key for this job.
    pub fn key(&self) -> String {
        generation_key(&self.model, &self.template)
    }
}

/// One element of the analysis stage's ordered work list, derived from a
/// recorded generation result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalysisJob {
    /// Position in the deterministic job ordering (generation job order).
    pub job_index: usize,
    /// Model slug.
    pub model: String,
    /// App number reserved during generation, if generation succeeded.
    pub app_number: Option<u32>,
    /// Whether the underlying generation succeeded.
    pub generation_success: bool,
}

impl AnalysisJob {
    /// Deduplication key for this job. `None` for failed generations.
    pub fn key(&self) -> Option<String> {
        self.app_number.map(|n| analysis_key(&self.model, n))
    }
}

/// Deduplication key for a generation job.
pub fn generation_key(model: &str, template: &str) -> String {
    format!("{}|{}", model, template)
}

/// Deduplication key for an analysis job.
pub fn analysis_key(model: &str, app_number: u32) -> String {
    format!("{}|{}", model, app_number)
}

/// Splits an analysis key back into `(model, app_number)`.
pub fn split_analysis_key(key: &str) -> Option<(String, u32)> {
    let (model, app) = key.rsplit_once('|')?;
    let app_number = app.parse().ok()?;
    Some((model.to_string(), app_number))
}

/// Outcome of one generation job, appended to the progress document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationResult {
    /// Position in the generation job ordering.
    pub job_index: usize,
    /// Model slug.
    pub model: String,
    /// Template identifier.
    pub template: String,
    /// Whether the app was generated.
    pub success: bool,
    /// App number reserved for this job, when generation succeeded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_number: Option<u32>,
    /// Failure description, when generation failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When the orchestrator recorded this outcome.
    pub recorded_at: DateTime<Utc>,
}

impl GenerationResult {
    /// Creates a successful result.
    pub fn success(job_index: usize, model: &str, template: &str, app_number: u32) -> Self {
        Self {
            job_index,
            model: model.to_string(),
            template: template.to_string(),
            success: true,
            app_number: Some(app_number),
            error: None,
            recorded_at: Utc::now(),
        }
    }

    /// Creates a failed result.
    pub fn failure(
        job_index: usize,
        model: &str,
        template: &str,
        error: impl Into<String>,
    ) -> Self {
        Self {
            job_index,
            model: model.to_string(),
            template: template.to_string(),
            success: false,
            app_number: None,
            error: Some(error.into()),
            recorded_at: Utc::now(),
        }
    }

    /// Deduplication key of the underlying job.
    pub fn key(&self) -> String {
        generation_key(&self.model, &self.template)
    }
}

/// Generation-stage slice of the progress document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationProgress {
    /// Number of jobs in the stage.
    pub total: usize,
    /// Successful generations.
    pub completed: usize,
    /// Failed generations.
    pub failed: usize,
    /// Keys of jobs handed to the worker pool but not yet recorded.
    #[serde(default)]
    pub in_flight_keys: BTreeSet<String>,
    /// Keys released after an interrupted run, eligible for re-dispatch,
    /// with their cross-tick attempt counter.
    #[serde(default)]
    pub retryable_keys: BTreeMap<String, u32>,
    /// Append-only outcome list, one entry per finished job.
    #[serde(default)]
    pub results: Vec<GenerationResult>,
}

impl GenerationProgress {
    /// Whether a result for `job_index` has already been recorded.
    pub fn has_result_for(&self, job_index: usize) -> bool {
        self.results.iter().any(|r| r.job_index == job_index)
    }

    /// Records an outcome. Replaying the same `job_index` is a no-op.
    ///
    /// Returns `true` if the result was appended.
    pub fn record(&mut self, result: GenerationResult) -> bool {
        if self.has_result_for(result.job_index) {
            return false;
        }
        self.in_flight_keys.remove(&result.key());
        self.retryable_keys.remove(&result.key());
        if result.success {
            self.completed += 1;
        } else {
            self.failed += 1;
        }
        self.results.push(result);
        true
    }

    /// Whether every job has a recorded outcome.
    pub fn is_complete(&self) -> bool {
        self.completed + self.failed >= self.total
    }

    /// Results ordered by job index; the analysis stage's work list.
    pub fn ordered_results(&self) -> Vec<&GenerationResult> {
        let mut ordered: Vec<&GenerationResult> = self.results.iter().collect();
        ordered.sort_by_key(|r| r.job_index);
        ordered
    }
}

/// Analysis-stage slice of the progress document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisProgress {
    /// Number of jobs in the stage (successful generations).
    pub total: usize,
    /// Main tasks that reached `completed` or `partial_success`, plus
    /// retry-bucket entries dropped after exhausting their budget.
    pub completed: usize,
    /// Main tasks that reached `failed` or `cancelled`.
    pub failed: usize,
    /// Authoritative list of created main tasks, used for completion
    /// counting.
    #[serde(default)]
    pub main_task_ids: Vec<Uuid>,
    /// Created subtasks; reference only.
    #[serde(default)]
    pub subtask_ids: Vec<Uuid>,
    /// Keys of jobs whose main task was durably created.
    #[serde(default)]
    pub submitted_apps: BTreeSet<String>,
    /// Keys of jobs released after a transient failure, with their
    /// cross-tick attempt counter.
    #[serde(default)]
    pub retryable_apps: BTreeMap<String, u32>,
    /// Main tasks already counted into `completed`/`failed`. Bookkeeping
    /// so the drain step is idempotent across ticks and restarts.
    #[serde(default)]
    pub drained_task_ids: BTreeSet<Uuid>,
}

impl AnalysisProgress {
    /// Whether every job reached an accounted terminal outcome.
    pub fn is_complete(&self) -> bool {
        self.completed + self.failed >= self.total
    }

    /// Marks a key submitted: inserts into `submitted_apps` and drops any
    /// retry-bucket entry, preserving the exclusivity invariant.
    pub fn mark_submitted(&mut self, key: &str) {
        self.retryable_apps.remove(key);
        self.submitted_apps.insert(key.to_string());
    }

    /// Moves a key into the retry bucket, preserving exclusivity with
    /// `submitted_apps`. Returns the attempt count after the move.
    pub fn mark_retryable(&mut self, key: &str) -> u32 {
        self.submitted_apps.remove(key);
        let attempts = self.retryable_apps.entry(key.to_string()).or_insert(0);
        *attempts += 1;
        *attempts
    }
}

/// The durable progress document, serialized as one JSON blob per row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    /// Generation-stage bookkeeping.
    pub generation: GenerationProgress,
    /// Analysis-stage bookkeeping.
    pub analysis: AnalysisProgress,
}

/// The durable root record of one pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineExecution {
    /// Stable unique identifier.
    pub id: Uuid,
    /// Lifecycle state.
    pub status: PipelineStatus,
    /// Active stage while `status = running`.
    pub current_stage: Stage,
    /// Pointer into the ordered job list of the active stage.
    pub current_job_index: usize,
    /// Frozen input.
    pub config: MatrixConfig,
    /// Durable progress document.
    pub progress: Progress,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last persisted mutation.
    pub updated_at: DateTime<Utc>,
}

impl PipelineExecution {
    /// Creates a new pipeline in `pending` state with frozen config.
    pub fn new(config: MatrixConfig) -> Self {
        let now = Utc::now();
        let generation_total = config.generation_total();
        let mut progress = Progress::default();
        progress.generation.total = generation_total;
        Self {
            id: Uuid::new_v4(),
            status: PipelineStatus::Pending,
            current_stage: Stage::Generation,
            current_job_index: 0,
            config,
            progress,
            created_at: now,
            updated_at: now,
        }
    }

    /// The analysis job at `job_index`, derived from recorded generation
    /// results ordered by their job index. `None` past the end.
    pub fn analysis_job(&self, job_index: usize) -> Option<AnalysisJob> {
        let ordered = self.progress.generation.ordered_results();
        let result = ordered.get(job_index)?;
        Some(AnalysisJob {
            job_index,
            model: result.model.clone(),
            app_number: result.app_number,
            generation_success: result.success,
        })
    }

    /// Number of entries in the analysis stage's ordered work list.
    pub fn analysis_job_count(&self) -> usize {
        self.progress.generation.results.len()
    }

    /// Every `(model, app_number)` pair this pipeline generated.
    pub fn touched_apps(&self) -> Vec<(String, u32)> {
        self.progress
            .generation
            .results
            .iter()
            .filter_map(|r| r.app_number.map(|n| (r.model.clone(), n)))
            .collect()
    }

    /// Structural integrity checks on the progress document. A violation
    /// here means the row was corrupted outside the orchestrator and is
    /// treated as fatal for this pipeline.
    pub fn validate_progress(&self) -> Result<(), String> {
        let generation = &self.progress.generation;
        let analysis = &self.progress.analysis;

        if self.status == PipelineStatus::Running && self.current_stage == Stage::Done {
            return Err("running pipeline cannot be in done stage".to_string());
        }
        if generation.completed + generation.failed > generation.total {
            return Err(format!(
                "generation counters exceed total: {} + {} > {}",
                generation.completed, generation.failed, generation.total
            ));
        }
        if analysis.main_task_ids.len() > generation.completed {
            return Err(format!(
                "main task count {} exceeds successful generations {}",
                analysis.main_task_ids.len(),
                generation.completed
            ));
        }
        if analysis.main_task_ids.len() + analysis.retryable_apps.len() > analysis.total
            && analysis.total > 0
        {
            return Err(format!(
                "main tasks {} + retryable {} exceed analysis total {}",
                analysis.main_task_ids.len(),
                analysis.retryable_apps.len(),
                analysis.total
            ));
        }
        if let Some(key) = analysis
            .submitted_apps
            .iter()
            .find(|k| analysis.retryable_apps.contains_key(*k))
        {
            return Err(format!(
                "key '{}' is both submitted and retryable",
                key
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_by_two() -> MatrixConfig {
        MatrixConfig::new(
            vec!["M1".to_string(), "M2".to_string()],
            vec!["T1".to_string(), "T2".to_string()],
            vec!["bandit".to_string(), "zap".to_string()],
        )
    }

    #[test]
    fn test_generation_job_ordering_is_models_outer() {
        let config = two_by_two();
        let jobs: Vec<GenerationJob> = (0..config.generation_total())
            .map(|i| config.generation_job(i).expect("job in range"))
            .collect();

        assert_eq!(jobs.len(), 4);
        assert_eq!((jobs[0].model.as_str(), jobs[0].template.as_str()), ("M1", "T1"));
        assert_eq!((jobs[1].model.as_str(), jobs[1].template.as_str()), ("M1", "T2"));
        assert_eq!((jobs[2].model.as_str(), jobs[2].template.as_str()), ("M2", "T1"));
        assert_eq!((jobs[3].model.as_str(), jobs[3].template.as_str()), ("M2", "T2"));
        assert!(config.generation_job(4).is_none());
    }

    #[test]
    fn test_generation_job_with_empty_templates() {
        let config = MatrixConfig::new(vec!["M1".to_string()], Vec::new(), Vec::new());
        assert_eq!(config.generation_total(), 0);
        assert!(config.generation_job(0).is_none());
    }

    #[test]
    fn test_dedup_keys() {
        assert_eq!(generation_key("M1", "T2"), "M1|T2");
        assert_eq!(analysis_key("M1", 7), "M1|7");
        assert_eq!(split_analysis_key("M1|7"), Some(("M1".to_string(), 7)));
        assert_eq!(split_analysis_key("no-separator"), None);
        // Models may themselves contain the separator; the app number is
        // always the last segment.
        assert_eq!(
            split_analysis_key("org|model|3"),
            Some(("org|model".to_string(), 3))
        );
    }

    #[test]
    fn test_record_generation_result_is_idempotent() {
        let mut progress = GenerationProgress {
            total: 2,
            ..Default::default()
        };
        progress.in_flight_keys.insert("M1|T1".to_string());

        let result = GenerationResult::success(0, "M1", "T1", 1);
        assert!(progress.record(result.clone()));
        assert_eq!(progress.completed, 1);
        assert!(progress.in_flight_keys.is_empty());

        // Replaying the same job index is a no-op.
        assert!(!progress.record(result));
        assert_eq!(progress.completed, 1);
        assert_eq!(progress.results.len(), 1);
    }

    #[test]
    fn test_record_failure_counts_failed() {
        let mut progress = GenerationProgress {
            total: 1,
            ..Default::default()
        };
        assert!(progress.record(GenerationResult::failure(0, "M1", "T1", "boom")));
        assert_eq!(progress.failed, 1);
        assert_eq!(progress.completed, 0);
        assert!(progress.is_complete());
    }

    #[test]
    fn test_ordered_results_reconstructs_position() {
        let mut progress = GenerationProgress {
            total: 3,
            ..Default::default()
        };
        // Completions arrive out of order.
        progress.record(GenerationResult::success(2, "M2", "T1", 3));
        progress.record(GenerationResult::success(0, "M1", "T1", 1));
        progress.record(GenerationResult::failure(1, "M1", "T2", "err"));

        let ordered = progress.ordered_results();
        let indexes: Vec<usize> = ordered.iter().map(|r| r.job_index).collect();
        assert_eq!(indexes, vec![0, 1, 2]);
    }

    #[test]
    fn test_analysis_submitted_and_retryable_are_exclusive() {
        let mut analysis = AnalysisProgress::default();
        analysis.mark_submitted("M1|1");
        assert!(analysis.submitted_apps.contains("M1|1"));

        let attempts = analysis.mark_retryable("M1|1");
        assert_eq!(attempts, 1);
        assert!(!analysis.submitted_apps.contains("M1|1"));
        assert!(analysis.retryable_apps.contains_key("M1|1"));

        assert_eq!(analysis.mark_retryable("M1|1"), 2);

        analysis.mark_submitted("M1|1");
        assert!(analysis.retryable_apps.is_empty());
    }

    #[test]
    fn test_analysis_job_derivation_skips_nothing() {
        let mut pipeline = PipelineExecution::new(two_by_two());
        pipeline.progress.generation.record(GenerationResult::success(0, "M1", "T1", 1));
        pipeline.progress.generation.record(GenerationResult::failure(1, "M1", "T2", "err"));

        let first = pipeline.analysis_job(0).expect("first job");
        assert!(first.generation_success);
        assert_eq!(first.key(), Some("M1|1".to_string()));

        let second = pipeline.analysis_job(1).expect("second job");
        assert!(!second.generation_success);
        assert_eq!(second.key(), None);

        assert!(pipeline.analysis_job(2).is_none());
        assert_eq!(pipeline.analysis_job_count(), 2);
    }

    #[test]
    fn test_new_pipeline_initial_state() {
        let pipeline = PipelineExecution::new(two_by_two());
        assert_eq!(pipeline.status, PipelineStatus::Pending);
        assert_eq!(pipeline.current_stage, Stage::Generation);
        assert_eq!(pipeline.current_job_index, 0);
        assert_eq!(pipeline.progress.generation.total, 4);
        assert_eq!(pipeline.progress.analysis.total, 0);
        assert!(pipeline.validate_progress().is_ok());
    }

    #[test]
    fn test_progress_serde_roundtrip_is_identity() {
        let mut pipeline = PipelineExecution::new(two_by_two());
        pipeline.progress.generation.record(GenerationResult::success(0, "M1", "T1", 1));
        pipeline.progress.analysis.total = 1;
        pipeline.progress.analysis.mark_submitted("M1|1");
        pipeline.progress.analysis.main_task_ids.push(Uuid::new_v4());

        let json = serde_json::to_string(&pipeline.progress).expect("serialize");
        let parsed: Progress = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(parsed, pipeline.progress);
    }

    #[test]
    fn test_validate_progress_rejects_dual_membership() {
        let mut pipeline = PipelineExecution::new(two_by_two());
        pipeline.progress.analysis.total = 2;
        pipeline
            .progress
            .generation
            .record(GenerationResult::success(0, "M1", "T1", 1));
        pipeline.progress.analysis.submitted_apps.insert("M1|1".to_string());
        pipeline.progress.analysis.retryable_apps.insert("M1|1".to_string(), 1);

        let err = pipeline.validate_progress().expect_err("should reject");
        assert!(err.contains("M1|1"));
    }

    #[test]
    fn test_validate_progress_rejects_excess_main_tasks() {
        let mut pipeline = PipelineExecution::new(two_by_two());
        pipeline.progress.analysis.main_task_ids.push(Uuid::new_v4());
        assert!(pipeline.validate_progress().is_err());
    }

    #[test]
    fn test_status_and_stage_textual_forms() {
        for status in [
            PipelineStatus::Pending,
            PipelineStatus::Running,
            PipelineStatus::Completed,
            PipelineStatus::Failed,
            PipelineStatus::Cancelled,
        ] {
            assert_eq!(PipelineStatus::parse(status.as_str()), Some(status));
        }
        assert!(PipelineStatus::parse("bogus").is_none());

        for stage in [Stage::Generation, Stage::Analysis, Stage::Done] {
            assert_eq!(Stage::parse(stage.as_str()), Some(stage));
        }
        assert!(Stage::parse("bogus").is_none());

        assert!(!PipelineStatus::Running.is_terminal());
        assert!(PipelineStatus::Cancelled.is_terminal());
    }
}
