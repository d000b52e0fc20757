//! Short-TTL cache of analyzer reachability.
//!
//! Positive probe results are cached for `HEALTH_CACHE_TTL` so a burst of
//! submissions does not hammer the health endpoints. Negative results are
//! never cached, so a recovering analyzer is detected on the next probe.
//! The cache is process-wide and invalidated whenever a pipeline enters
//! its analysis stage.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::config::HEALTH_CACHE_TTL;

use super::client::AnalyzerClient;
use super::registry::ServiceKind;

/// Process-wide analyzer reachability cache.
pub struct HealthCache {
    /// Service -> time of the last successful probe.
    entries: RwLock<HashMap<ServiceKind, Instant>>,
    /// Positive-result lifetime.
    ttl: Duration,
}

impl HealthCache {
    /// Creates a cache with the standard TTL.
    pub fn new() -> Self {
        Self::with_ttl(HEALTH_CACHE_TTL)
    }

    /// Creates a cache with a custom TTL (tests shorten it).
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Whether a positive probe result for `service` is still fresh.
    pub fn is_healthy(&self, service: ServiceKind) -> bool {
        let entries = self.entries.read().expect("health cache lock poisoned");
        entries
            .get(&service)
            .is_some_and(|probed_at| probed_at.elapsed() < self.ttl)
    }

    /// Records a successful probe.
    pub fn record_healthy(&self, service: ServiceKind) {
        let mut entries = self.entries.write().expect("health cache lock poisoned");
        entries.insert(service, Instant::now());
    }

    /// Clears all entries. Called when a pipeline enters its analysis
    /// stage so the first submission re-probes every required service.
    pub fn invalidate(&self) {
        let mut entries = self.entries.write().expect("health cache lock poisoned");
        if !entries.is_empty() {
            debug!(entries = entries.len(), "Invalidating analyzer health cache");
        }
        entries.clear();
    }

    /// Probes `service` until healthy or the deadline passes.
    ///
    /// Uses exponential backoff starting at `initial_delay`; a cached
    /// positive result short-circuits the probe entirely.
    pub async fn ensure_healthy(
        &self,
        client: &dyn AnalyzerClient,
        service: ServiceKind,
        initial_delay: Duration,
        deadline: Duration,
    ) -> bool {
        if self.is_healthy(service) {
            return true;
        }

        let started = Instant::now();
        let mut delay = initial_delay;
        loop {
            if client.ping(service).await {
                self.record_healthy(service);
                info!(service = %service, "Analyzer healthy");
                return true;
            }
            if started.elapsed() + delay > deadline {
                return false;
            }
            tokio::time::sleep(delay).await;
            delay = delay.saturating_mul(2);
        }
    }
}

impl Default for HealthCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use crate::analyzers::client::{AnalyzerError, RawAnalyzerResponse};

    /// Probe stub that fails a fixed number of times before recovering.
    struct FlakyAnalyzer {
        failures_left: AtomicUsize,
        probes: AtomicUsize,
    }

    impl FlakyAnalyzer {
        fn new(failures: usize) -> Self {
            Self {
                failures_left: AtomicUsize::new(failures),
                probes: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl AnalyzerClient for FlakyAnalyzer {
        async fn run_tools(
            &self,
            _service: ServiceKind,
            _model: &str,
            _app_number: u32,
            _tools: &[String],
            _timeout: Duration,
        ) -> Result<RawAnalyzerResponse, AnalyzerError> {
            unreachable!("health tests never run tools")
        }

        async fn ping(&self, _service: ServiceKind) -> bool {
            self.probes.fetch_add(1, Ordering::SeqCst);
            if self.failures_left.load(Ordering::SeqCst) > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                false
            } else {
                true
            }
        }
    }

    #[test]
    fn test_negative_results_not_cached() {
        let cache = HealthCache::new();
        assert!(!cache.is_healthy(ServiceKind::StaticAnalyzer));
        // Nothing was inserted by the miss.
        assert!(!cache.is_healthy(ServiceKind::StaticAnalyzer));
    }

    #[test]
    fn test_positive_result_cached_until_ttl() {
        let cache = HealthCache::with_ttl(Duration::from_millis(20));
        cache.record_healthy(ServiceKind::StaticAnalyzer);
        assert!(cache.is_healthy(ServiceKind::StaticAnalyzer));

        std::thread::sleep(Duration::from_millis(30));
        assert!(!cache.is_healthy(ServiceKind::StaticAnalyzer));
    }

    #[test]
    fn test_invalidate_clears_all_entries() {
        let cache = HealthCache::new();
        cache.record_healthy(ServiceKind::StaticAnalyzer);
        cache.record_healthy(ServiceKind::DynamicAnalyzer);
        cache.invalidate();
        assert!(!cache.is_healthy(ServiceKind::StaticAnalyzer));
        assert!(!cache.is_healthy(ServiceKind::DynamicAnalyzer));
    }

    #[tokio::test]
    async fn test_ensure_healthy_retries_until_recovery() {
        let cache = HealthCache::new();
        let analyzer = FlakyAnalyzer::new(2);

        let healthy = cache
            .ensure_healthy(
                &analyzer,
                ServiceKind::StaticAnalyzer,
                Duration::from_millis(1),
                Duration::from_secs(1),
            )
            .await;

        assert!(healthy);
        assert_eq!(analyzer.probes.load(Ordering::SeqCst), 3);
        assert!(cache.is_healthy(ServiceKind::StaticAnalyzer));
    }

    #[tokio::test]
    async fn test_ensure_healthy_gives_up_at_deadline() {
        let cache = HealthCache::new();
        let analyzer = FlakyAnalyzer::new(usize::MAX);

        let healthy = cache
            .ensure_healthy(
                &analyzer,
                ServiceKind::StaticAnalyzer,
                Duration::from_millis(5),
                Duration::from_millis(20),
            )
            .await;

        assert!(!healthy);
        assert!(!cache.is_healthy(ServiceKind::StaticAnalyzer));
    }

    #[tokio::test]
    async fn test_ensure_healthy_short_circuits_on_cached_entry() {
        let cache = HealthCache::new();
        cache.record_healthy(ServiceKind::StaticAnalyzer);
        let analyzer = FlakyAnalyzer::new(usize::MAX);

        let healthy = cache
            .ensure_healthy(
                &analyzer,
                ServiceKind::StaticAnalyzer,
                Duration::from_millis(1),
                Duration::from_millis(10),
            )
            .await;

        assert!(healthy);
        assert_eq!(analyzer.probes.load(Ordering::SeqCst), 0);
    }
}
