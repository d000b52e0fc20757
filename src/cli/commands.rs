//! Command handlers: wire the collaborators together and run.

use std::sync::Arc;

use anyhow::Context;
use tracing::info;
use uuid::Uuid;

use crate::analyzers::client::HttpAnalyzerClient;
use crate::analyzers::health::HealthCache;
use crate::analyzers::normalize::NormalizeOptions;
use crate::analyzers::registry::ToolRegistry;
use crate::config::{
    OrchestratorConfig, DEFAULT_MAX_CONCURRENT_ANALYSIS, DEFAULT_MAX_CONCURRENT_GENERATION,
};
use crate::containers::{ContainerManager, DockerContainerManager, NoopContainerManager};
use crate::engine::{OrchestratorLoop, StageEngine};
use crate::generation::allocator::{AppNumberAllocator, PgAppNumberAllocator};
use crate::generation::{GenerationWorker, HttpGenerationService};
use crate::metrics::OrchestratorMetrics;
use crate::pipeline::execution::{MatrixConfig, PipelineStatus};
use crate::pipeline::store::{PgPipelineStore, PipelineStore};
use crate::storage::{
    Database, MemoryAppNumberAllocator, MemoryPipelineStore, MemoryTaskStore,
};
use crate::tasks::store::{PgTaskStore, TaskStore};
use crate::tasks::TaskExecutor;

/// Builds the orchestrator over either backend and runs until Ctrl-C.
pub async fn serve(memory: bool) -> anyhow::Result<()> {
    let config = if memory {
        OrchestratorConfig::default()
    } else {
        OrchestratorConfig::from_env().context("loading configuration")?
    };

    let (pipeline_store, task_store, allocator): (
        Arc<dyn PipelineStore>,
        Arc<dyn TaskStore>,
        Arc<dyn AppNumberAllocator>,
    ) = if memory {
        info!("Using the in-memory backend");
        (
            Arc::new(MemoryPipelineStore::new()),
            Arc::new(MemoryTaskStore::new()),
            Arc::new(MemoryAppNumberAllocator::new()),
        )
    } else {
        let database = Database::connect_and_migrate(&config.database_url)
            .await
            .context("preparing the database")?;
        let pool = database.pool().clone();
        (
            Arc::new(PgPipelineStore::new(pool.clone())),
            Arc::new(PgTaskStore::new(pool.clone())),
            Arc::new(PgAppNumberAllocator::new(pool)),
        )
    };

    let containers: Arc<dyn ContainerManager> = if memory {
        Arc::new(NoopContainerManager)
    } else {
        Arc::new(DockerContainerManager::new().context("connecting to Docker")?)
    };

    let registry = Arc::new(ToolRegistry::builtin());
    let analyzer: Arc<dyn crate::analyzers::client::AnalyzerClient> =
        Arc::new(HttpAnalyzerClient::new(&config.analyzer_base_url));
    let health = Arc::new(HealthCache::new());
    let generation_service = Arc::new(HttpGenerationService::new(&config.generation_service_url));
    let generation_worker = Arc::new(GenerationWorker::new(generation_service, allocator));
    let options = NormalizeOptions::new(config.full_raw_outputs, config.raw_output_max_issues);
    let executor = Arc::new(TaskExecutor::new(
        Arc::clone(&task_store),
        Arc::clone(&analyzer),
        options,
    ));
    let metrics = Arc::new(OrchestratorMetrics::new().context("registering metrics")?);

    let engine = Arc::new(StageEngine::new(
        pipeline_store,
        task_store,
        generation_worker,
        analyzer,
        containers,
        registry,
        health,
        executor,
        metrics,
    ));
    let orchestrator = OrchestratorLoop::new(engine);

    orchestrator.start().await.context("starting orchestrator")?;
    info!("Orchestrator serving; press Ctrl-C to stop");
    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    orchestrator.stop().await;
    Ok(())
}

/// Creates a pipeline in pending state.
pub async fn create(
    models: Vec<String>,
    templates: Vec<String>,
    tools: Vec<String>,
    max_concurrent_generation: Option<usize>,
    max_concurrent_analysis: Option<usize>,
) -> anyhow::Result<()> {
    // Reject unknown tools before persisting anything.
    let registry = ToolRegistry::builtin();
    let canonical: Result<Vec<String>, _> = tools
        .iter()
        .map(|t| registry.resolve(t).map(str::to_string))
        .collect();
    let canonical = canonical.context("resolving tool names")?;

    let config = MatrixConfig::new(models, templates, canonical)
        .with_max_concurrent_generation(
            max_concurrent_generation.unwrap_or(DEFAULT_MAX_CONCURRENT_GENERATION),
        )
        .with_max_concurrent_analysis(
            max_concurrent_analysis.unwrap_or(DEFAULT_MAX_CONCURRENT_ANALYSIS),
        );

    let store = pg_pipeline_store().await?;
    let pipeline = store.create(config).await.context("creating pipeline")?;
    println!("{}", pipeline.id);
    Ok(())
}

/// Lists persisted pipelines.
pub async fn list() -> anyhow::Result<()> {
    let store = pg_pipeline_store().await?;
    let pipelines = store.list_all().await.context("listing pipelines")?;
    for p in pipelines {
        println!(
            "{}  {:<10} {:<10} gen {}/{}  analysis {}/{}",
            p.id,
            p.status,
            p.current_stage,
            p.progress.generation.completed + p.progress.generation.failed,
            p.progress.generation.total,
            p.progress.analysis.completed + p.progress.analysis.failed,
            p.progress.analysis.total,
        );
    }
    Ok(())
}

/// Prints one pipeline row as pretty JSON.
pub async fn show(id: Uuid) -> anyhow::Result<()> {
    let store = pg_pipeline_store().await?;
    let pipeline = store.load(id).await.context("loading pipeline")?;
    println!("{}", serde_json::to_string_pretty(&pipeline)?);
    Ok(())
}

/// Cancels a pipeline.
pub async fn cancel(id: Uuid) -> anyhow::Result<()> {
    let store = pg_pipeline_store().await?;
    let mut lock = store.lock(id).await.context("locking pipeline")?;
    if lock.pipeline().status.is_terminal() {
        println!("{} already {}", id, lock.pipeline().status);
        return Ok(());
    }
    lock.pipeline().status = PipelineStatus::Cancelled;
    lock.commit().await.context("committing cancellation")?;
    println!("{} cancelled", id);
    Ok(())
}

/// Applies database migrations.
pub async fn migrate() -> anyhow::Result<()> {
    let config = OrchestratorConfig::from_env().context("loading configuration")?;
    let database = Database::connect(&config.database_url)
        .await
        .context("connecting to the database")?;
    let applied = database.migrate().await.context("applying schema steps")?;
    if applied == 0 {
        println!("schema already up to date");
    } else {
        println!("{} schema steps applied", applied);
    }
    Ok(())
}

async fn pg_pipeline_store() -> anyhow::Result<PgPipelineStore> {
    let config = OrchestratorConfig::from_env().context("loading configuration")?;
    let database = Database::connect(&config.database_url)
        .await
        .context("connecting to the database")?;
    Ok(PgPipelineStore::new(database.pool().clone()))
}
