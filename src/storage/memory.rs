//! In-memory backend.
//!
//! Implements the store traits without a database: rows live in shared
//! maps, and the pipeline row lock degrades to a per-row async mutex,
//! the documented non-locking mode of the store contract. Safe for a
//! single orchestrator process, which is the only deployment this
//! backend is meant for. Used by the test suite and by `serve --memory`
//! local runs.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::analyzers::registry::ServiceKind;
use crate::generation::allocator::{AllocatorError, AppNumberAllocator};
use crate::pipeline::execution::{MatrixConfig, PipelineExecution, PipelineStatus};
use crate::pipeline::store::{PipelineRowLock, PipelineStore};
use crate::tasks::store::{CreatedTasks, TaskStore};
use crate::tasks::{AnalysisTask, TaskStatus};

use super::StoreError;

/// In-memory pipeline store with per-row async mutex locking.
#[derive(Default)]
pub struct MemoryPipelineStore {
    rows: Arc<Mutex<HashMap<Uuid, PipelineExecution>>>,
    row_locks: Arc<Mutex<HashMap<Uuid, Arc<AsyncMutex<()>>>>>,
}

impl MemoryPipelineStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn row_lock_for(&self, id: Uuid) -> Arc<AsyncMutex<()>> {
        let mut locks = self.row_locks.lock().expect("row lock map poisoned");
        Arc::clone(locks.entry(id).or_default())
    }
}

#[async_trait]
impl PipelineStore for MemoryPipelineStore {
    async fn create(&self, config: MatrixConfig) -> Result<PipelineExecution, StoreError> {
        let pipeline = PipelineExecution::new(config);
        let mut rows = self.rows.lock().expect("pipeline rows poisoned");
        rows.insert(pipeline.id, pipeline.clone());
        Ok(pipeline)
    }

    async fn list_running(&self) -> Result<Vec<PipelineExecution>, StoreError> {
        let rows = self.rows.lock().expect("pipeline rows poisoned");
        let mut running: Vec<PipelineExecution> = rows
            .values()
            .filter(|p| p.status == PipelineStatus::Running)
            .cloned()
            .collect();
        running.sort_by_key(|p| p.id);
        Ok(running)
    }

    async fn list_all(&self) -> Result<Vec<PipelineExecution>, StoreError> {
        let rows = self.rows.lock().expect("pipeline rows poisoned");
        let mut all: Vec<PipelineExecution> = rows.values().cloned().collect();
        all.sort_by_key(|p| p.id);
        Ok(all)
    }

    async fn load(&self, id: Uuid) -> Result<PipelineExecution, StoreError> {
        let rows = self.rows.lock().expect("pipeline rows poisoned");
        rows.get(&id).cloned().ok_or(StoreError::NotFound(id))
    }

    async fn commit(&self, pipeline: &mut PipelineExecution) -> Result<(), StoreError> {
        pipeline.updated_at = Utc::now();
        let mut rows = self.rows.lock().expect("pipeline rows poisoned");
        if !rows.contains_key(&pipeline.id) {
            return Err(StoreError::NotFound(pipeline.id));
        }
        rows.insert(pipeline.id, pipeline.clone());
        Ok(())
    }

    async fn lock(&self, id: Uuid) -> Result<Box<dyn PipelineRowLock>, StoreError> {
        let guard = self.row_lock_for(id).lock_owned().await;
        let pipeline = {
            let rows = self.rows.lock().expect("pipeline rows poisoned");
            rows.get(&id).cloned().ok_or(StoreError::NotFound(id))?
        };
        Ok(Box::new(MemoryPipelineRowLock {
            _guard: guard,
            pipeline,
            rows: Arc::clone(&self.rows),
        }))
    }
}

/// Row-lock guard over the shared map; dropping without commit discards
/// staged mutations.
struct MemoryPipelineRowLock {
    _guard: OwnedMutexGuard<()>,
    pipeline: PipelineExecution,
    rows: Arc<Mutex<HashMap<Uuid, PipelineExecution>>>,
}

#[async_trait]
impl PipelineRowLock for MemoryPipelineRowLock {
    fn pipeline(&mut self) -> &mut PipelineExecution {
        &mut self.pipeline
    }

    async fn commit(mut self: Box<Self>) -> Result<PipelineExecution, StoreError> {
        self.pipeline.updated_at = Utc::now();
        let mut rows = self.rows.lock().expect("pipeline rows poisoned");
        rows.insert(self.pipeline.id, self.pipeline.clone());
        Ok(self.pipeline)
    }
}

/// In-memory task store.
#[derive(Default)]
pub struct MemoryTaskStore {
    tasks: Arc<Mutex<HashMap<Uuid, AnalysisTask>>>,
}

impl MemoryTaskStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// All main tasks of a pipeline; test helper.
    pub fn main_tasks_of(&self, pipeline_id: Uuid) -> Vec<AnalysisTask> {
        let tasks = self.tasks.lock().expect("task rows poisoned");
        let mut mains: Vec<AnalysisTask> = tasks
            .values()
            .filter(|t| t.pipeline_id == pipeline_id && t.is_main_task)
            .cloned()
            .collect();
        mains.sort_by_key(|t| t.created_at);
        mains
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn create_main_with_subtasks(
        &self,
        pipeline_id: Uuid,
        model: &str,
        app_number: u32,
        groups: &[(ServiceKind, Vec<String>)],
    ) -> Result<CreatedTasks, StoreError> {
        let mut tasks = self.tasks.lock().expect("task rows poisoned");

        // The in-memory twin of the partial unique index on main tasks.
        let duplicate = tasks.values().any(|t| {
            t.is_main_task
                && t.pipeline_id == pipeline_id
                && t.model == model
                && t.app_number == app_number
        });
        if duplicate {
            return Err(StoreError::Duplicate(format!(
                "main task for ({}, {}, {})",
                pipeline_id, model, app_number
            )));
        }

        let all_tools: Vec<String> = groups
            .iter()
            .flat_map(|(_, tools)| tools.iter().cloned())
            .collect();
        let mut main = AnalysisTask::main(pipeline_id, model, app_number, all_tools);

        let mut subtask_ids = Vec::with_capacity(groups.len());
        let mut subtasks = Vec::with_capacity(groups.len());
        for (service, tools) in groups {
            let subtask = AnalysisTask::subtask(&main, *service, tools.clone());
            subtask_ids.push(subtask.task_id);
            subtasks.push(subtask);
        }

        // Everything lands under one mutex hold, so consumers can never
        // observe a pending main without its subtasks.
        main.status = TaskStatus::Pending;
        let main_id = main.task_id;
        tasks.insert(main_id, main);
        for subtask in subtasks {
            tasks.insert(subtask.task_id, subtask);
        }

        Ok(CreatedTasks {
            main_id,
            subtask_ids,
        })
    }

    async fn get(&self, task_id: Uuid) -> Result<AnalysisTask, StoreError> {
        let tasks = self.tasks.lock().expect("task rows poisoned");
        tasks
            .get(&task_id)
            .cloned()
            .ok_or(StoreError::NotFound(task_id))
    }

    async fn terminal_state(&self, task_id: Uuid) -> Result<Option<TaskStatus>, StoreError> {
        let status = self.status(task_id).await?;
        Ok(status.is_terminal().then_some(status))
    }

    async fn status(&self, task_id: Uuid) -> Result<TaskStatus, StoreError> {
        let tasks = self.tasks.lock().expect("task rows poisoned");
        tasks
            .get(&task_id)
            .map(|t| t.status)
            .ok_or(StoreError::NotFound(task_id))
    }

    async fn find_main_task(
        &self,
        pipeline_id: Uuid,
        model: &str,
        app_number: u32,
    ) -> Result<Option<AnalysisTask>, StoreError> {
        let tasks = self.tasks.lock().expect("task rows poisoned");
        Ok(tasks
            .values()
            .find(|t| {
                t.is_main_task
                    && t.pipeline_id == pipeline_id
                    && t.model == model
                    && t.app_number == app_number
            })
            .cloned())
    }

    async fn subtasks_of(&self, main_id: Uuid) -> Result<Vec<AnalysisTask>, StoreError> {
        let tasks = self.tasks.lock().expect("task rows poisoned");
        let mut subtasks: Vec<AnalysisTask> = tasks
            .values()
            .filter(|t| t.parent_task_id == Some(main_id))
            .cloned()
            .collect();
        subtasks.sort_by_key(|t| (t.created_at, t.task_id));
        Ok(subtasks)
    }

    async fn update_status(&self, task_id: Uuid, status: TaskStatus) -> Result<(), StoreError> {
        let mut tasks = self.tasks.lock().expect("task rows poisoned");
        let task = tasks.get_mut(&task_id).ok_or(StoreError::NotFound(task_id))?;
        task.status = status;
        task.updated_at = Utc::now();
        Ok(())
    }
}

/// In-memory allocator; reservations serialize on one mutex, so numbers
/// are dense per model and never collide.
#[derive(Default)]
pub struct MemoryAppNumberAllocator {
    allocated: Mutex<HashSet<(String, u32)>>,
}

impl MemoryAppNumberAllocator {
    /// Creates an empty allocator.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AppNumberAllocator for MemoryAppNumberAllocator {
    async fn reserve(&self, model: &str) -> Result<u32, AllocatorError> {
        let mut allocated = self.allocated.lock().expect("allocation set poisoned");
        let highest = allocated
            .iter()
            .filter(|(m, _)| m == model)
            .map(|(_, n)| *n)
            .max()
            .unwrap_or(0);
        let candidate = highest + 1;
        allocated.insert((model.to_string(), candidate));
        Ok(candidate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::execution::Stage;

    fn config() -> MatrixConfig {
        MatrixConfig::new(
            vec!["M1".to_string()],
            vec!["T1".to_string()],
            vec!["bandit".to_string()],
        )
    }

    #[tokio::test]
    async fn test_pipeline_create_load_commit() {
        let store = MemoryPipelineStore::new();
        let created = store.create(config()).await.expect("create");

        let mut loaded = store.load(created.id).await.expect("load");
        assert_eq!(loaded, created);

        loaded.status = PipelineStatus::Running;
        store.commit(&mut loaded).await.expect("commit");

        let running = store.list_running().await.expect("list");
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].id, created.id);
    }

    #[tokio::test]
    async fn test_lock_discards_on_drop_and_persists_on_commit() {
        let store = MemoryPipelineStore::new();
        let created = store.create(config()).await.expect("create");

        {
            let mut lock = store.lock(created.id).await.expect("lock");
            lock.pipeline().current_job_index = 5;
            // Dropped without commit.
        }
        let reloaded = store.load(created.id).await.expect("load");
        assert_eq!(reloaded.current_job_index, 0);

        let mut lock = store.lock(created.id).await.expect("lock");
        lock.advance_job_index();
        lock.commit().await.expect("commit");

        let reloaded = store.load(created.id).await.expect("load");
        assert_eq!(reloaded.current_job_index, 1);
    }

    #[tokio::test]
    async fn test_mark_job_retryable_moves_between_sets() {
        let store = MemoryPipelineStore::new();
        let created = store.create(config()).await.expect("create");

        let mut lock = store.lock(created.id).await.expect("lock");
        lock.pipeline().progress.analysis.mark_submitted("M1|1");
        assert_eq!(lock.mark_job_retryable(Stage::Analysis, "M1|1"), 1);
        let committed = lock.commit().await.expect("commit");

        assert!(!committed.progress.analysis.submitted_apps.contains("M1|1"));
        assert_eq!(
            committed.progress.analysis.retryable_apps.get("M1|1"),
            Some(&1)
        );
    }

    #[tokio::test]
    async fn test_task_creation_is_atomic_and_unique() {
        let store = MemoryTaskStore::new();
        let pipeline_id = Uuid::new_v4();
        let groups = vec![
            (ServiceKind::StaticAnalyzer, vec!["bandit".to_string()]),
            (ServiceKind::DynamicAnalyzer, vec!["zap".to_string()]),
        ];

        let created = store
            .create_main_with_subtasks(pipeline_id, "M1", 1, &groups)
            .await
            .expect("create");
        assert_eq!(created.subtask_ids.len(), 2);

        let main = store.get(created.main_id).await.expect("get");
        assert_eq!(main.status, TaskStatus::Pending);
        assert_eq!(main.tools, vec!["bandit".to_string(), "zap".to_string()]);

        let subtasks = store.subtasks_of(created.main_id).await.expect("subtasks");
        assert_eq!(subtasks.len(), 2);
        assert!(subtasks.iter().all(|t| t.status == TaskStatus::Pending));

        // Second creation for the same app is rejected.
        let err = store
            .create_main_with_subtasks(pipeline_id, "M1", 1, &groups)
            .await
            .expect_err("duplicate");
        assert!(err.is_unique_violation());
    }

    #[tokio::test]
    async fn test_terminal_state_reporting() {
        let store = MemoryTaskStore::new();
        let created = store
            .create_main_with_subtasks(Uuid::new_v4(), "M1", 1, &[])
            .await
            .expect("create");

        assert_eq!(store.terminal_state(created.main_id).await.expect("query"), None);

        store
            .update_status(created.main_id, TaskStatus::PartialSuccess)
            .await
            .expect("update");
        assert_eq!(
            store.terminal_state(created.main_id).await.expect("query"),
            Some(TaskStatus::PartialSuccess)
        );
    }

    #[tokio::test]
    async fn test_allocator_yields_distinct_numbers_under_concurrency() {
        let allocator = Arc::new(MemoryAppNumberAllocator::new());

        let mut handles = Vec::new();
        for _ in 0..8 {
            let allocator = Arc::clone(&allocator);
            handles.push(tokio::spawn(
                async move { allocator.reserve("M1").await },
            ));
        }

        let mut numbers = HashSet::new();
        for handle in handles {
            let number = handle.await.expect("join").expect("reserve");
            assert!(numbers.insert(number), "duplicate app number {}", number);
        }
        assert_eq!(numbers.len(), 8);

        // A different model starts its own sequence.
        assert_eq!(allocator.reserve("M2").await.expect("reserve"), 1);
    }
}
