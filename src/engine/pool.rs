//! Bounded worker pools.
//!
//! One pool per stage, process-wide. Submission spawns a task gated by a
//! semaphore (so at most `max_workers` run at once, excess submissions
//! queue) and the finished outcome lands in a channel the engine drains
//! non-blockingly on each tick. Outcomes are immutable values; the pool
//! is the only cross-task hand-off in the orchestrator.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, info};

/// A bounded pool producing outcomes of type `T`.
pub struct WorkerPool<T> {
    name: &'static str,
    semaphore: Arc<Semaphore>,
    outcome_tx: mpsc::UnboundedSender<T>,
    outcome_rx: Mutex<mpsc::UnboundedReceiver<T>>,
    in_flight: Arc<AtomicUsize>,
    max_workers: usize,
}

impl<T: Send + 'static> WorkerPool<T> {
    /// Creates a pool running at most `max_workers` tasks concurrently.
    pub fn new(name: &'static str, max_workers: usize) -> Self {
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
        Self {
            name,
            semaphore: Arc::new(Semaphore::new(max_workers)),
            outcome_tx,
            outcome_rx: Mutex::new(outcome_rx),
            in_flight: Arc::new(AtomicUsize::new(0)),
            max_workers,
        }
    }

    /// Submits work. Returns immediately; the work runs once a pool slot
    /// frees up and its outcome becomes visible through [`drain`].
    ///
    /// Work submitted after [`close`] is dropped without running.
    ///
    /// [`drain`]: WorkerPool::drain
    /// [`close`]: WorkerPool::close
    pub fn submit<F>(&self, work: F)
    where
        F: Future<Output = T> + Send + 'static,
    {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let semaphore = Arc::clone(&self.semaphore);
        let outcome_tx = self.outcome_tx.clone();
        let in_flight = Arc::clone(&self.in_flight);

        tokio::spawn(async move {
            // A closed semaphore means the pool is shutting down; the
            // work is dropped and its job key recovered elsewhere.
            if let Ok(_permit) = semaphore.acquire_owned().await {
                let outcome = work.await;
                let _ = outcome_tx.send(outcome);
            }
            in_flight.fetch_sub(1, Ordering::SeqCst);
        });
    }

    /// Collects every finished outcome without blocking.
    pub fn drain(&self) -> Vec<T> {
        let mut rx = self.outcome_rx.lock().expect("pool receiver poisoned");
        let mut outcomes = Vec::new();
        while let Ok(outcome) = rx.try_recv() {
            outcomes.push(outcome);
        }
        outcomes
    }

    /// Number of submissions not yet finished (queued or running).
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Waits until the pool is idle, up to `timeout`. Returns `true` if
    /// it went idle in time.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.in_flight() > 0 {
            if tokio::time::Instant::now() >= deadline {
                debug!(
                    pool = self.name,
                    in_flight = self.in_flight(),
                    "Pool still busy at deadline"
                );
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        true
    }

    /// Stops queued-but-unstarted work from ever starting. Running work
    /// finishes normally.
    pub fn close(&self) {
        info!(pool = self.name, "Closing worker pool");
        self.semaphore.close();
    }

    /// The configured concurrency bound.
    pub fn max_workers(&self) -> usize {
        self.max_workers
    }
}
