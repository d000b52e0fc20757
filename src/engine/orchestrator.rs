//! Top-level orchestrator loop.
//!
//! A single background task scans for active pipelines every
//! `POLL_INTERVAL` and dispatches them to the stage engine. Shutdown is
//! two-phase: signal, bounded wait for in-flight work, park what
//! remains, bounded join.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::{GRACEFUL_SHUTDOWN_TIMEOUT, POLL_INTERVAL, THREAD_JOIN_TIMEOUT};
use crate::error::{Classify, ErrorKind};
use crate::pipeline::execution::{PipelineExecution, PipelineStatus};
use crate::storage::StoreError;

use super::stage::StageEngine;
use super::EngineError;

/// Owns the poll task and the operational control surface.
pub struct OrchestratorLoop {
    engine: Arc<StageEngine>,
    poll_interval: Duration,
    shutdown_tx: broadcast::Sender<()>,
    handle: Mutex<Option<JoinHandle<()>>>,
    is_running: AtomicBool,
}

impl OrchestratorLoop {
    /// Creates the loop over a shared engine.
    pub fn new(engine: Arc<StageEngine>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            engine,
            poll_interval: POLL_INTERVAL,
            shutdown_tx,
            handle: Mutex::new(None),
            is_running: AtomicBool::new(false),
        }
    }

    /// Overrides the poll cadence (tests shorten it).
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Recovers stranded work and begins polling. Idempotent: a second
    /// call while running is a no-op.
    pub async fn start(&self) -> Result<(), EngineError> {
        if self.is_running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        // Keys left in-flight by a crash have no live worker anymore;
        // park them so the submit step re-dispatches.
        self.engine.park_in_flight_generation().await?;

        let engine = Arc::clone(&self.engine);
        let poll_interval = self.poll_interval;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let handle = tokio::spawn(async move {
            info!(poll_interval_ms = poll_interval.as_millis() as u64, "Orchestrator loop started");
            loop {
                Self::tick(&engine).await;
                tokio::select! {
                    _ = tokio::time::sleep(poll_interval) => {}
                    _ = shutdown_rx.recv() => {
                        info!("Orchestrator loop received shutdown signal");
                        break;
                    }
                }
            }
        });
        *self.handle.lock().expect("loop handle poisoned") = Some(handle);

        Ok(())
    }

    /// One scheduling tick: drain worker outcomes, then advance every
    /// pending or running pipeline in id order.
    async fn tick(engine: &StageEngine) {
        engine.drain_outcomes().await;

        let pipelines = match engine.pipeline_store().list_all().await {
            Ok(pipelines) => pipelines,
            Err(e) => {
                error!(error = %e, "Pipeline scan failed");
                return;
            }
        };

        for pipeline in pipelines.iter().filter(|p| {
            matches!(p.status, PipelineStatus::Pending | PipelineStatus::Running)
        }) {
            if let Err(e) = engine.advance(pipeline).await {
                match e.kind() {
                    ErrorKind::Fatal => {
                        error!(pipeline_id = %pipeline.id, error = %e, "Fatal pipeline error");
                        if let Err(fail_err) =
                            engine.fail_pipeline(pipeline.id, &e.to_string()).await
                        {
                            error!(
                                pipeline_id = %pipeline.id,
                                error = %fail_err,
                                "Could not mark pipeline failed"
                            );
                        }
                    }
                    kind => {
                        // Non-fatal errors retry on later ticks.
                        warn!(
                            pipeline_id = %pipeline.id,
                            kind = %kind,
                            error = %e,
                            "Pipeline advance deferred"
                        );
                    }
                }
            }
        }
    }

    /// Graceful shutdown: stop polling, wait bounded time for in-flight
    /// workers, record what finished, park what did not, then close the
    /// pools with a bounded join.
    pub async fn stop(&self) {
        if !self.is_running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("Stopping orchestrator");

        let _ = self.shutdown_tx.send(());
        let handle = self.handle.lock().expect("loop handle poisoned").take();
        if let Some(handle) = handle {
            if tokio::time::timeout(THREAD_JOIN_TIMEOUT, handle).await.is_err() {
                warn!("Poll task did not stop within the join timeout");
            }
        }

        if !self.engine.wait_for_workers(GRACEFUL_SHUTDOWN_TIMEOUT).await {
            warn!("In-flight workers missed the shutdown deadline");
        }

        // Record everything that finished during the wait, then park the
        // jobs that are still running so a restart re-dispatches them.
        self.engine.drain_outcomes().await;
        if let Err(e) = self.engine.park_in_flight_generation().await {
            error!(error = %e, "Failed to persist incomplete state");
        }

        self.engine.close_pools();
        self.engine.wait_for_workers(THREAD_JOIN_TIMEOUT).await;
        info!("Orchestrator stopped");
    }

    /// Cancels a pipeline. The engine stops enqueueing work for it;
    /// already-submitted work drains without being aborted.
    pub async fn cancel_pipeline(&self, pipeline_id: Uuid) -> Result<(), EngineError> {
        let mut lock = self.engine.pipeline_store().lock(pipeline_id).await?;
        let was_running = lock.pipeline().status == PipelineStatus::Running;
        if lock.pipeline().status.is_terminal() {
            return Ok(());
        }
        lock.pipeline().status = PipelineStatus::Cancelled;
        lock.commit().await?;
        if was_running {
            self.engine.metrics().running_pipelines.dec();
        }
        info!(pipeline_id = %pipeline_id, "Pipeline cancelled");
        Ok(())
    }

    /// All persisted pipelines, id order.
    pub async fn list_pipelines(&self) -> Result<Vec<PipelineExecution>, StoreError> {
        self.engine.pipeline_store().list_all().await
    }

    /// One persisted pipeline row.
    pub async fn get_pipeline(&self, pipeline_id: Uuid) -> Result<PipelineExecution, StoreError> {
        self.engine.pipeline_store().load(pipeline_id).await
    }

    /// Whether the poll task is active.
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// The engine driven by this loop.
    pub fn engine(&self) -> &Arc<StageEngine> {
        &self.engine
    }
}
