//! Analysis task model.
//!
//! One *main* task groups the per-service *subtasks* created for a
//! `(model, app_number)` pair. Main and subtasks are created atomically;
//! subtask statuses are advanced by task execution and aggregated back
//! into the main task when all of them are terminal.

pub mod executor;
pub mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::analyzers::registry::ServiceKind;

pub use executor::TaskExecutor;
pub use store::{CreatedTasks, PgTaskStore, TaskStore};

/// Lifecycle state of an analysis task (main or subtask).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Row inserted; subtasks may not all exist yet. Never observable by
    /// external consumers thanks to creation ordering.
    Created,
    /// Ready for execution.
    Pending,
    /// Picked up by a worker.
    Running,
    /// Every tool group succeeded.
    Completed,
    /// Finished with a mix of success and failure.
    PartialSuccess,
    /// Finished without any success.
    Failed,
    /// Abandoned before completion.
    Cancelled,
}

impl TaskStatus {
    /// Whether this status is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed
                | TaskStatus::PartialSuccess
                | TaskStatus::Failed
                | TaskStatus::Cancelled
        )
    }

    /// Whether this terminal status counts as a completion for pipeline
    /// progress (partial success does).
    pub fn counts_completed(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::PartialSuccess)
    }

    /// Stable textual form used in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Created => "created",
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::PartialSuccess => "partial_success",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    /// Parses the database textual form.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "created" => Some(TaskStatus::Created),
            "pending" => Some(TaskStatus::Pending),
            "running" => Some(TaskStatus::Running),
            "completed" => Some(TaskStatus::Completed),
            "partial_success" => Some(TaskStatus::PartialSuccess),
            "failed" => Some(TaskStatus::Failed),
            "cancelled" => Some(TaskStatus::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Durable analysis task row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisTask {
    /// Unique task identifier.
    pub task_id: Uuid,
    /// Pipeline this task belongs to.
    pub pipeline_id: Uuid,
    /// Set on subtasks; `None` on main tasks.
    pub parent_task_id: Option<Uuid>,
    /// Whether this is the grouping main task.
    pub is_main_task: bool,
    /// Model slug of the analyzed app.
    pub model: String,
    /// App number of the analyzed app.
    pub app_number: u32,
    /// Owning analyzer service; subtasks only.
    pub service_name: Option<ServiceKind>,
    /// Canonical tool names this task covers.
    pub tools: Vec<String>,
    /// Lifecycle state.
    pub status: TaskStatus,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last status change.
    pub updated_at: DateTime<Utc>,
}

impl AnalysisTask {
    /// Creates a main task in `created` state.
    pub fn main(pipeline_id: Uuid, model: &str, app_number: u32, tools: Vec<String>) -> Self {
        let now = Utc::now();
        Self {
            task_id: Uuid::new_v4(),
            pipeline_id,
            parent_task_id: None,
            is_main_task: true,
            model: model.to_string(),
            app_number,
            service_name: None,
            tools,
            status: TaskStatus::Created,
            created_at: now,
            updated_at: now,
        }
    }

    /// Creates a subtask in `pending` state bound to one service.
    pub fn subtask(parent: &AnalysisTask, service: ServiceKind, tools: Vec<String>) -> Self {
        let now = Utc::now();
        Self {
            task_id: Uuid::new_v4(),
            pipeline_id: parent.pipeline_id,
            parent_task_id: Some(parent.task_id),
            is_main_task: false,
            model: parent.model.clone(),
            app_number: parent.app_number,
            service_name: Some(service),
            tools,
            status: TaskStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Aggregates terminal subtask statuses into the main task status.
///
/// All completed -> `Completed`; any success among non-successes ->
/// `PartialSuccess`; no success -> `Failed`. An empty slice (no tool
/// groups) aggregates to `Completed`.
pub fn aggregate_main_status(subtask_statuses: &[TaskStatus]) -> TaskStatus {
    if subtask_statuses.is_empty() {
        return TaskStatus::Completed;
    }
    let successes = subtask_statuses
        .iter()
        .filter(|s| matches!(s, TaskStatus::Completed))
        .count();
    let partials = subtask_statuses
        .iter()
        .filter(|s| matches!(s, TaskStatus::PartialSuccess))
        .count();
    if successes == subtask_statuses.len() {
        TaskStatus::Completed
    } else if successes + partials > 0 {
        TaskStatus::PartialSuccess
    } else {
        TaskStatus::Failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::PartialSuccess.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Created.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
    }

    #[test]
    fn test_completion_counting() {
        assert!(TaskStatus::Completed.counts_completed());
        assert!(TaskStatus::PartialSuccess.counts_completed());
        assert!(!TaskStatus::Failed.counts_completed());
        assert!(!TaskStatus::Cancelled.counts_completed());
    }

    #[test]
    fn test_status_textual_roundtrip() {
        for status in [
            TaskStatus::Created,
            TaskStatus::Pending,
            TaskStatus::Running,
            TaskStatus::Completed,
            TaskStatus::PartialSuccess,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
        ] {
            assert_eq!(TaskStatus::parse(status.as_str()), Some(status));
        }
        assert!(TaskStatus::parse("bogus").is_none());
    }

    #[test]
    fn test_main_and_subtask_construction() {
        let pipeline_id = Uuid::new_v4();
        let main = AnalysisTask::main(
            pipeline_id,
            "M1",
            4,
            vec!["bandit".to_string(), "zap".to_string()],
        );
        assert!(main.is_main_task);
        assert_eq!(main.status, TaskStatus::Created);
        assert!(main.parent_task_id.is_none());
        assert!(main.service_name.is_none());

        let sub = AnalysisTask::subtask(
            &main,
            ServiceKind::StaticAnalyzer,
            vec!["bandit".to_string()],
        );
        assert!(!sub.is_main_task);
        assert_eq!(sub.parent_task_id, Some(main.task_id));
        assert_eq!(sub.pipeline_id, pipeline_id);
        assert_eq!(sub.status, TaskStatus::Pending);
        assert_eq!(sub.service_name, Some(ServiceKind::StaticAnalyzer));
        assert_eq!(sub.app_number, 4);
    }

    #[test]
    fn test_aggregate_all_completed() {
        let statuses = [TaskStatus::Completed, TaskStatus::Completed];
        assert_eq!(aggregate_main_status(&statuses), TaskStatus::Completed);
    }

    #[test]
    fn test_aggregate_mixed_is_partial() {
        let statuses = [TaskStatus::Completed, TaskStatus::Failed];
        assert_eq!(aggregate_main_status(&statuses), TaskStatus::PartialSuccess);

        let statuses = [TaskStatus::PartialSuccess, TaskStatus::Failed];
        assert_eq!(aggregate_main_status(&statuses), TaskStatus::PartialSuccess);
    }

    #[test]
    fn test_aggregate_all_failed() {
        let statuses = [TaskStatus::Failed, TaskStatus::Failed];
        assert_eq!(aggregate_main_status(&statuses), TaskStatus::Failed);
    }

    #[test]
    fn test_aggregate_empty_is_completed() {
        assert_eq!(aggregate_main_status(&[]), TaskStatus::Completed);
    }
}
