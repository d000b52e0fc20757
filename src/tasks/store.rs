//! Analysis task persistence.
//!
//! The one non-negotiable property here is creation atomicity: a main
//! task and all of its per-service subtasks are inserted in a single
//! transaction, and the main task only flips from `created` to `pending`
//! after every subtask row exists. Consumers scanning for pending main
//! tasks therefore never observe a main without its subtasks.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::analyzers::registry::ServiceKind;
use crate::storage::StoreError;

use super::{AnalysisTask, TaskStatus};

/// IDs produced by an atomic main-plus-subtasks creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedTasks {
    /// The main task.
    pub main_id: Uuid,
    /// Subtasks in service routing order.
    pub subtask_ids: Vec<Uuid>,
}

/// Durable task operations.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Atomically creates one main task plus one subtask per service
    /// group. The groups come pre-resolved from the tool registry.
    ///
    /// # Errors
    ///
    /// Returns a unique-violation `StoreError` if a main task for
    /// `(pipeline_id, model, app_number)` already exists.
    async fn create_main_with_subtasks(
        &self,
        pipeline_id: Uuid,
        model: &str,
        app_number: u32,
        groups: &[(ServiceKind, Vec<String>)],
    ) -> Result<CreatedTasks, StoreError>;

    /// Loads one task.
    async fn get(&self, task_id: Uuid) -> Result<AnalysisTask, StoreError>;

    /// The task's status if it is terminal, `None` otherwise or when the
    /// row does not exist yet.
    async fn terminal_state(&self, task_id: Uuid) -> Result<Option<TaskStatus>, StoreError>;

    /// The task's current status, terminal or not.
    async fn status(&self, task_id: Uuid) -> Result<TaskStatus, StoreError>;

    /// Finds the main task for `(pipeline_id, model, app_number)`, if one
    /// was ever created.
    async fn find_main_task(
        &self,
        pipeline_id: Uuid,
        model: &str,
        app_number: u32,
    ) -> Result<Option<AnalysisTask>, StoreError>;

    /// Whether a main task exists for `(pipeline_id, model, app_number)`.
    async fn main_task_exists(
        &self,
        pipeline_id: Uuid,
        model: &str,
        app_number: u32,
    ) -> Result<bool, StoreError> {
        Ok(self
            .find_main_task(pipeline_id, model, app_number)
            .await?
            .is_some())
    }

    /// Subtasks of a main task, in creation order.
    async fn subtasks_of(&self, main_id: Uuid) -> Result<Vec<AnalysisTask>, StoreError>;

    /// Updates a task's status.
    async fn update_status(&self, task_id: Uuid, status: TaskStatus) -> Result<(), StoreError>;
}

/// Postgres-backed task store.
pub struct PgTaskStore {
    pool: PgPool,
}

impl PgTaskStore {
    /// Creates a store over an existing pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_task(row: &sqlx::postgres::PgRow) -> Result<AnalysisTask, StoreError> {
        let task_id: Uuid = row.get("task_id");
        let status_raw: String = row.get("status");
        let status = TaskStatus::parse(&status_raw).ok_or_else(|| StoreError::Corrupt {
            id: task_id,
            message: format!("unknown task status '{}'", status_raw),
        })?;
        let service_raw: Option<String> = row.get("service_name");
        let service_name = match service_raw {
            Some(raw) => Some(ServiceKind::parse(&raw).map_err(|_| StoreError::Corrupt {
                id: task_id,
                message: format!("unknown service '{}'", raw),
            })?),
            None => None,
        };
        let tools_json: serde_json::Value = row.get("tools_json");
        let tools: Vec<String> = serde_json::from_value(tools_json)?;
        let app_number: i32 = row.get("app_number");
        let created_at: DateTime<Utc> = row.get("created_at");
        let updated_at: DateTime<Utc> = row.get("updated_at");

        Ok(AnalysisTask {
            task_id,
            pipeline_id: row.get("pipeline_id"),
            parent_task_id: row.get("parent_task_id"),
            is_main_task: row.get("is_main_task"),
            model: row.get("model"),
            app_number: app_number as u32,
            service_name,
            tools,
            status,
            created_at,
            updated_at,
        })
    }
}

#[async_trait]
impl TaskStore for PgTaskStore {
    async fn create_main_with_subtasks(
        &self,
        pipeline_id: Uuid,
        model: &str,
        app_number: u32,
        groups: &[(ServiceKind, Vec<String>)],
    ) -> Result<CreatedTasks, StoreError> {
        let all_tools: Vec<String> = groups
            .iter()
            .flat_map(|(_, tools)| tools.iter().cloned())
            .collect();
        let main = AnalysisTask::main(pipeline_id, model, app_number, all_tools);

        let mut tx = self.pool.begin().await?;

        let tools_json = serde_json::to_value(&main.tools)?;
        sqlx::query(
            r#"
            INSERT INTO analysis_tasks (
                task_id, pipeline_id, parent_task_id, is_main_task,
                model, app_number, service_name, tools_json, status,
                created_at, updated_at
            ) VALUES ($1, $2, NULL, TRUE, $3, $4, NULL, $5, $6, $7, $8)
            "#,
        )
        .bind(main.task_id)
        .bind(pipeline_id)
        .bind(model)
        .bind(app_number as i32)
        .bind(&tools_json)
        .bind(TaskStatus::Created.as_str())
        .bind(main.created_at)
        .bind(main.updated_at)
        .execute(&mut *tx)
        .await?;

        let mut subtask_ids = Vec::with_capacity(groups.len());
        for (service, tools) in groups {
            let subtask = AnalysisTask::subtask(&main, *service, tools.clone());
            let sub_tools_json = serde_json::to_value(&subtask.tools)?;
            sqlx::query(
                r#"
                INSERT INTO analysis_tasks (
                    task_id, pipeline_id, parent_task_id, is_main_task,
                    model, app_number, service_name, tools_json, status,
                    created_at, updated_at
                ) VALUES ($1, $2, $3, FALSE, $4, $5, $6, $7, $8, $9, $10)
                "#,
            )
            .bind(subtask.task_id)
            .bind(pipeline_id)
            .bind(main.task_id)
            .bind(model)
            .bind(app_number as i32)
            .bind(service.as_str())
            .bind(&sub_tools_json)
            .bind(TaskStatus::Pending.as_str())
            .bind(subtask.created_at)
            .bind(subtask.updated_at)
            .execute(&mut *tx)
            .await?;
            subtask_ids.push(subtask.task_id);
        }

        // Flip the main to pending only after every subtask row exists.
        sqlx::query("UPDATE analysis_tasks SET status = $2, updated_at = NOW() WHERE task_id = $1")
            .bind(main.task_id)
            .bind(TaskStatus::Pending.as_str())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(CreatedTasks {
            main_id: main.task_id,
            subtask_ids,
        })
    }

    async fn get(&self, task_id: Uuid) -> Result<AnalysisTask, StoreError> {
        let row = sqlx::query("SELECT * FROM analysis_tasks WHERE task_id = $1")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound(task_id))?;
        Self::row_to_task(&row)
    }

    async fn terminal_state(&self, task_id: Uuid) -> Result<Option<TaskStatus>, StoreError> {
        let status = self.status(task_id).await?;
        Ok(status.is_terminal().then_some(status))
    }

    async fn status(&self, task_id: Uuid) -> Result<TaskStatus, StoreError> {
        let row = sqlx::query("SELECT status FROM analysis_tasks WHERE task_id = $1")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound(task_id))?;
        let raw: String = row.get("status");
        TaskStatus::parse(&raw).ok_or_else(|| StoreError::Corrupt {
            id: task_id,
            message: format!("unknown task status '{}'", raw),
        })
    }

    async fn find_main_task(
        &self,
        pipeline_id: Uuid,
        model: &str,
        app_number: u32,
    ) -> Result<Option<AnalysisTask>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT * FROM analysis_tasks
            WHERE pipeline_id = $1 AND model = $2 AND app_number = $3 AND is_main_task
            LIMIT 1
            "#,
        )
        .bind(pipeline_id)
        .bind(model)
        .bind(app_number as i32)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::row_to_task).transpose()
    }

    async fn subtasks_of(&self, main_id: Uuid) -> Result<Vec<AnalysisTask>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM analysis_tasks WHERE parent_task_id = $1 ORDER BY created_at, task_id",
        )
        .bind(main_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_task).collect()
    }

    async fn update_status(&self, task_id: Uuid, status: TaskStatus) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE analysis_tasks SET status = $2, updated_at = NOW() WHERE task_id = $1",
        )
        .bind(task_id)
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(task_id));
        }
        Ok(())
    }
}
