//! Task execution: drives the subtasks of a main analysis task.
//!
//! Each subtask is one analyzer call: run the tool group on the owning
//! service, normalize the response, record the terminal status. When all
//! subtasks are terminal their statuses aggregate into the main task.
//! Tool failures and timeouts are task-level outcomes here; nothing in
//! this module can fail a pipeline.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};
use uuid::Uuid;

use crate::analyzers::client::AnalyzerClient;
use crate::analyzers::normalize::{normalize, NormalizeOptions, NormalizedResult, RunStatus};
use crate::error::Classify;
use crate::storage::StoreError;

use super::store::TaskStore;
use super::{aggregate_main_status, AnalysisTask, TaskStatus};

/// Default per-analyzer-call deadline.
pub const DEFAULT_ANALYZER_CALL_TIMEOUT: Duration = Duration::from_secs(600);

/// Executes main analysis tasks by fanning their subtasks out to the
/// analyzer services.
pub struct TaskExecutor {
    task_store: Arc<dyn TaskStore>,
    analyzer: Arc<dyn AnalyzerClient>,
    options: NormalizeOptions,
    call_timeout: Duration,
}

impl TaskExecutor {
    /// Creates an executor over the injected collaborators.
    pub fn new(
        task_store: Arc<dyn TaskStore>,
        analyzer: Arc<dyn AnalyzerClient>,
        options: NormalizeOptions,
    ) -> Self {
        Self {
            task_store,
            analyzer,
            options,
            call_timeout: DEFAULT_ANALYZER_CALL_TIMEOUT,
        }
    }

    /// Overrides the per-call deadline (tests shorten it).
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Runs a main task to a terminal status.
    ///
    /// Idempotent and resumable: an already-terminal main returns its
    /// status unchanged, and subtasks that finished in a previous run are
    /// not re-executed.
    ///
    /// # Errors
    ///
    /// Only store failures propagate; analyzer failures are recorded as
    /// subtask outcomes.
    pub async fn execute_main(&self, main_id: Uuid) -> Result<TaskStatus, StoreError> {
        let main = self.task_store.get(main_id).await?;
        if main.status.is_terminal() {
            return Ok(main.status);
        }

        self.task_store
            .update_status(main_id, TaskStatus::Running)
            .await?;

        let subtasks = self.task_store.subtasks_of(main_id).await?;
        let mut statuses = Vec::with_capacity(subtasks.len());
        for subtask in subtasks {
            let status = if subtask.status.is_terminal() {
                subtask.status
            } else {
                self.execute_subtask(&subtask).await?
            };
            statuses.push(status);
        }

        let aggregated = aggregate_main_status(&statuses);
        self.task_store.update_status(main_id, aggregated).await?;

        info!(
            task_id = %main_id,
            model = %main.model,
            app_number = main.app_number,
            status = %aggregated,
            "Main analysis task finished"
        );
        Ok(aggregated)
    }

    /// Runs one subtask to a terminal status.
    async fn execute_subtask(&self, subtask: &AnalysisTask) -> Result<TaskStatus, StoreError> {
        let service = match subtask.service_name {
            Some(service) => service,
            None => {
                // A subtask without a service cannot be routed; the row
                // was created outside the atomic creation path.
                warn!(task_id = %subtask.task_id, "Subtask has no service, failing it");
                self.task_store
                    .update_status(subtask.task_id, TaskStatus::Failed)
                    .await?;
                return Ok(TaskStatus::Failed);
            }
        };

        self.task_store
            .update_status(subtask.task_id, TaskStatus::Running)
            .await?;

        let started = std::time::Instant::now();
        let response = self
            .analyzer
            .run_tools(
                service,
                &subtask.model,
                subtask.app_number,
                &subtask.tools,
                self.call_timeout,
            )
            .await;

        let status = match response {
            Ok(raw) => {
                let normalized = normalize(&subtask.tools, &raw, started.elapsed(), &self.options);
                self.log_result(subtask, service, &normalized);
                match normalized.status {
                    RunStatus::Completed => TaskStatus::Completed,
                    RunStatus::Partial => TaskStatus::PartialSuccess,
                    RunStatus::Failed => TaskStatus::Failed,
                }
            }
            Err(e) => {
                warn!(
                    task_id = %subtask.task_id,
                    service = %service,
                    kind = %e.kind(),
                    error = %e,
                    "Analyzer call failed"
                );
                TaskStatus::Failed
            }
        };

        self.task_store
            .update_status(subtask.task_id, status)
            .await?;
        Ok(status)
    }

    fn log_result(&self, subtask: &AnalysisTask, service: crate::analyzers::registry::ServiceKind, result: &NormalizedResult) {
        let total_issues: usize = result.tool_results.values().map(|t| t.total_issues).sum();
        info!(
            task_id = %subtask.task_id,
            service = %service,
            tools = result.tools_requested.len(),
            total_issues,
            duration_seconds = result.analysis_duration,
            "Analyzer run normalized"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Mutex;

    use crate::analyzers::client::{AnalyzerError, RawAnalyzerResponse};
    use crate::analyzers::registry::ServiceKind;
    use crate::storage::MemoryTaskStore;

    /// Analyzer stub returning a configured status per tool.
    struct ScriptedAnalyzer {
        statuses: Mutex<HashMap<String, &'static str>>,
        unreachable_services: Vec<ServiceKind>,
    }

    impl ScriptedAnalyzer {
        fn all_success() -> Self {
            Self {
                statuses: Mutex::new(HashMap::new()),
                unreachable_services: Vec::new(),
            }
        }

        fn with_status(self, tool: &str, status: &'static str) -> Self {
            self.statuses
                .lock()
                .expect("statuses")
                .insert(tool.to_string(), status);
            self
        }

        fn with_unreachable(mut self, service: ServiceKind) -> Self {
            self.unreachable_services.push(service);
            self
        }
    }

    #[async_trait]
    impl AnalyzerClient for ScriptedAnalyzer {
        async fn run_tools(
            &self,
            service: ServiceKind,
            _model: &str,
            _app_number: u32,
            tools: &[String],
            _timeout: Duration,
        ) -> Result<RawAnalyzerResponse, AnalyzerError> {
            if self.unreachable_services.contains(&service) {
                return Err(AnalyzerError::Unreachable {
                    service,
                    message: "connection refused".to_string(),
                });
            }
            let statuses = self.statuses.lock().expect("statuses");
            let mut reports = serde_json::Map::new();
            for tool in tools {
                let status = statuses.get(tool).copied().unwrap_or("success");
                reports.insert(tool.clone(), json!({ "status": status, "total_issues": 0 }));
            }
            Ok(RawAnalyzerResponse {
                results: json!({ "analysis": { "results": { "python": reports } } }),
                metadata: json!({}),
            })
        }

        async fn ping(&self, _service: ServiceKind) -> bool {
            true
        }
    }

    fn executor(
        store: Arc<MemoryTaskStore>,
        analyzer: ScriptedAnalyzer,
    ) -> TaskExecutor {
        TaskExecutor::new(store, Arc::new(analyzer), NormalizeOptions::default())
            .with_call_timeout(Duration::from_secs(5))
    }

    fn two_service_groups() -> Vec<(ServiceKind, Vec<String>)> {
        vec![
            (ServiceKind::StaticAnalyzer, vec!["bandit".to_string()]),
            (ServiceKind::DynamicAnalyzer, vec!["zap".to_string()]),
        ]
    }

    #[tokio::test]
    async fn test_all_success_aggregates_to_completed() {
        let store = Arc::new(MemoryTaskStore::new());
        let created = store
            .create_main_with_subtasks(Uuid::new_v4(), "M1", 1, &two_service_groups())
            .await
            .expect("create");

        let executor = executor(Arc::clone(&store), ScriptedAnalyzer::all_success());
        let status = executor.execute_main(created.main_id).await.expect("run");

        assert_eq!(status, TaskStatus::Completed);
        assert_eq!(
            store.status(created.main_id).await.expect("status"),
            TaskStatus::Completed
        );
        for id in created.subtask_ids {
            assert_eq!(store.status(id).await.expect("status"), TaskStatus::Completed);
        }
    }

    #[tokio::test]
    async fn test_failed_tool_group_aggregates_to_partial_success() {
        let store = Arc::new(MemoryTaskStore::new());
        let created = store
            .create_main_with_subtasks(Uuid::new_v4(), "M1", 1, &two_service_groups())
            .await
            .expect("create");

        let analyzer = ScriptedAnalyzer::all_success().with_status("zap", "failed");
        let executor = executor(Arc::clone(&store), analyzer);
        let status = executor.execute_main(created.main_id).await.expect("run");

        assert_eq!(status, TaskStatus::PartialSuccess);
    }

    #[tokio::test]
    async fn test_unreachable_service_fails_its_subtask_only() {
        let store = Arc::new(MemoryTaskStore::new());
        let created = store
            .create_main_with_subtasks(Uuid::new_v4(), "M1", 1, &two_service_groups())
            .await
            .expect("create");

        let analyzer =
            ScriptedAnalyzer::all_success().with_unreachable(ServiceKind::DynamicAnalyzer);
        let executor = executor(Arc::clone(&store), analyzer);
        let status = executor.execute_main(created.main_id).await.expect("run");

        assert_eq!(status, TaskStatus::PartialSuccess);
        let subtasks = store.subtasks_of(created.main_id).await.expect("subtasks");
        let dynamic = subtasks
            .iter()
            .find(|t| t.service_name == Some(ServiceKind::DynamicAnalyzer))
            .expect("dynamic subtask");
        assert_eq!(dynamic.status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn test_all_failed_aggregates_to_failed() {
        let store = Arc::new(MemoryTaskStore::new());
        let created = store
            .create_main_with_subtasks(
                Uuid::new_v4(),
                "M1",
                1,
                &[(ServiceKind::StaticAnalyzer, vec!["bandit".to_string()])],
            )
            .await
            .expect("create");

        let analyzer = ScriptedAnalyzer::all_success().with_status("bandit", "failed");
        let executor = executor(Arc::clone(&store), analyzer);
        let status = executor.execute_main(created.main_id).await.expect("run");

        assert_eq!(status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn test_terminal_main_is_not_re_executed() {
        let store = Arc::new(MemoryTaskStore::new());
        let created = store
            .create_main_with_subtasks(Uuid::new_v4(), "M1", 1, &two_service_groups())
            .await
            .expect("create");
        store
            .update_status(created.main_id, TaskStatus::Completed)
            .await
            .expect("update");

        // Unreachable everywhere: execution would fail if attempted.
        let analyzer = ScriptedAnalyzer::all_success()
            .with_unreachable(ServiceKind::StaticAnalyzer)
            .with_unreachable(ServiceKind::DynamicAnalyzer);
        let executor = executor(Arc::clone(&store), analyzer);
        let status = executor.execute_main(created.main_id).await.expect("run");

        assert_eq!(status, TaskStatus::Completed);
        // Subtasks were left untouched.
        let subtasks = store.subtasks_of(created.main_id).await.expect("subtasks");
        assert!(subtasks.iter().all(|t| t.status == TaskStatus::Pending));
    }

    #[tokio::test]
    async fn test_resume_skips_terminal_subtasks() {
        let store = Arc::new(MemoryTaskStore::new());
        let created = store
            .create_main_with_subtasks(Uuid::new_v4(), "M1", 1, &two_service_groups())
            .await
            .expect("create");

        // First subtask already finished in a previous run.
        store
            .update_status(created.subtask_ids[0], TaskStatus::Completed)
            .await
            .expect("update");

        let executor = executor(Arc::clone(&store), ScriptedAnalyzer::all_success());
        let status = executor.execute_main(created.main_id).await.expect("run");
        assert_eq!(status, TaskStatus::Completed);
    }
}
