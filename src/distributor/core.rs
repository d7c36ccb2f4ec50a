//! The protocol-agnostic fan-out core
//!
//! Holds the adapter registry, dispatches one payload to N targets with
//! bounded concurrency, applies per-target retry/backoff and timeouts, and
//! aggregates per-target outcomes into one `DistributionResult`. Per-target
//! failures never escape as errors: a `distribute` call always returns a
//! complete result with one entry per target.

use crate::adapter::ProtocolAdapter;
use crate::config::{DistributorSection, RetryConfig};
use crate::distributor::result::{
    AdapterResult, DistributionResult, DistributionTarget, DistributorStats, DistributorStatus,
    Timing,
};
use crate::distributor::retry::execute_with_retry;
use crate::error::{DistributorError, DistributorResult as SetupResult, ErrorCode};
use chrono::Utc;
use futures::future::join_all;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// Per-call options for `distribute`. Retry is on by default.
#[derive(Debug, Clone)]
pub struct DistributeOptions {
    /// Overrides the configured `max_concurrency` for this call.
    pub concurrency: Option<usize>,
    /// `false` bypasses the retry wrapper entirely.
    pub retry: bool,
    /// Overrides the configured retry policy for this call.
    pub retry_config: Option<RetryConfig>,
    /// Deadline per adapter call; elapsing yields a `TIMEOUT` result.
    pub timeout: Option<Duration>,
}

impl Default for DistributeOptions {
    fn default() -> Self {
        Self {
            concurrency: None,
            retry: true,
            retry_config: None,
            timeout: None,
        }
    }
}

impl DistributeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn without_retry() -> Self {
        Self {
            retry: false,
            ..Default::default()
        }
    }
}

/// Protocol-agnostic event distributor.
///
/// Adapters are dependency-injected through [`register_protocol`]; each
/// distributor instance owns its own registry so independent distributors can
/// coexist in one process.
///
/// [`register_protocol`]: UniversalDistributor::register_protocol
pub struct UniversalDistributor {
    config: DistributorSection,
    adapters: RwLock<HashMap<String, Arc<dyn ProtocolAdapter>>>,
    active: AtomicBool,
    stats: Mutex<DistributorStats>,
}

impl UniversalDistributor {
    pub fn new(config: DistributorSection) -> Self {
        Self {
            config,
            adapters: RwLock::new(HashMap::new()),
            active: AtomicBool::new(false),
            stats: Mutex::new(DistributorStats::default()),
        }
    }

    /// Register an adapter under `name`.
    ///
    /// Errors iff `adapter.protocol() != name`: a programmer error caught at
    /// setup time, the one boundary where an error return (rather than a
    /// failed per-target result) is the right shape.
    pub fn register_protocol(
        &self,
        name: &str,
        adapter: Arc<dyn ProtocolAdapter>,
    ) -> SetupResult<()> {
        if adapter.protocol() != name {
            return Err(DistributorError::ProtocolMismatch {
                name: name.to_string(),
                adapter: adapter.protocol().to_string(),
            });
        }
        let mut registry = self.adapters.write().unwrap();
        registry.insert(name.to_string(), adapter);
        info!(protocol = name, "adapter registered");
        Ok(())
    }

    /// Remove an adapter. Returns whether one was present.
    pub fn unregister_protocol(&self, name: &str) -> bool {
        let removed = self.adapters.write().unwrap().remove(name).is_some();
        if removed {
            info!(protocol = name, "adapter unregistered");
        }
        removed
    }

    /// Registered protocol names, sorted.
    pub fn protocols(&self) -> Vec<String> {
        let mut names: Vec<String> = self.adapters.read().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn start(&self) {
        self.active.store(true, Ordering::SeqCst);
        info!("distributor started");
    }

    /// Stop serving `distribute` calls. The adapter registry survives
    /// start/stop cycles.
    pub fn stop(&self) {
        self.active.store(false, Ordering::SeqCst);
        info!("distributor stopped");
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Fan one payload out to every target.
    ///
    /// Concurrency is semaphore-bounded: up to `concurrency` targets in
    /// flight at once, slots freeing individually so one slow target never
    /// stalls the rest. Results keep submission order and there is exactly
    /// one per target.
    pub async fn distribute(
        &self,
        data: &Value,
        targets: &[DistributionTarget],
        options: &DistributeOptions,
    ) -> DistributionResult {
        let call_start = Utc::now();

        if !self.is_active() {
            warn!(
                targets = targets.len(),
                "distribute called on inactive distributor"
            );
            let results = targets
                .iter()
                .map(|t| {
                    AdapterResult::failure(
                        &t.protocol,
                        "distributor is not started",
                        ErrorCode::DistributorInactive,
                        Timing::since(call_start),
                    )
                })
                .collect();
            return self.finalize(results, call_start);
        }

        let concurrency = options
            .concurrency
            .unwrap_or(self.config.max_concurrency)
            .max(1);
        let retry_config = options
            .retry_config
            .clone()
            .unwrap_or_else(|| self.config.retry.clone());
        let semaphore = Arc::new(Semaphore::new(concurrency));

        debug!(
            targets = targets.len(),
            concurrency,
            retry = options.retry,
            "starting fan-out"
        );

        let futures = targets.iter().map(|target| {
            let semaphore = semaphore.clone();
            let adapter = self
                .adapters
                .read()
                .unwrap()
                .get(&target.protocol)
                .cloned();
            let retry_config = retry_config.clone();
            async move {
                // Acquire never fails: the semaphore is never closed
                let _permit = semaphore.acquire().await.expect("semaphore closed");
                let start = Utc::now();

                let adapter = match adapter {
                    Some(a) => a,
                    None => {
                        return AdapterResult::failure(
                            &target.protocol,
                            format!("no adapter registered for protocol {:?}", target.protocol),
                            ErrorCode::ProtocolNotFound,
                            Timing::since(start),
                        );
                    }
                };

                let send = async {
                    if options.retry {
                        execute_with_retry(
                            adapter.as_ref(),
                            data,
                            &target.config,
                            &retry_config,
                        )
                        .await
                    } else {
                        adapter.send(data, &target.config).await
                    }
                };

                match options.timeout {
                    Some(deadline) => match tokio::time::timeout(deadline, send).await {
                        Ok(result) => result,
                        Err(_) => AdapterResult::failure(
                            &target.protocol,
                            format!("deadline of {}ms exceeded", deadline.as_millis()),
                            ErrorCode::Timeout,
                            Timing::since(start),
                        ),
                    },
                    None => send.await,
                }
            }
        });

        let results = join_all(futures).await;
        self.finalize(results, call_start)
    }

    fn finalize(
        &self,
        results: Vec<AdapterResult>,
        call_start: chrono::DateTime<Utc>,
    ) -> DistributionResult {
        let total_duration_ms = (Utc::now() - call_start).num_milliseconds().max(0) as u64;
        let result = DistributionResult::from_results(results, total_duration_ms);

        // Full-structure replacement keeps the stats update atomic
        {
            let mut stats = self.stats.lock().unwrap();
            *stats = DistributorStats {
                total_distributed: stats.total_distributed + result.metrics.total_targets as u64,
                total_successful: stats.total_successful
                    + result.metrics.successful_targets as u64,
                total_failed: stats.total_failed + result.metrics.failed_targets as u64,
                last_distribution_time: Some(Utc::now()),
            };
        }

        debug!(
            total = result.metrics.total_targets,
            failed = result.metrics.failed_targets,
            duration_ms = result.metrics.total_duration_ms,
            "fan-out complete"
        );
        result
    }

    /// Check every registered adapter. An unhealthy adapter is reported as
    /// `false` for that protocol and never aborts the sweep.
    pub async fn health_check(&self) -> HashMap<String, bool> {
        let adapters: Vec<(String, Arc<dyn ProtocolAdapter>)> = {
            let registry = self.adapters.read().unwrap();
            registry
                .iter()
                .map(|(name, adapter)| (name.clone(), adapter.clone()))
                .collect()
        };

        let mut report = HashMap::with_capacity(adapters.len());
        for (name, adapter) in adapters {
            let healthy = adapter.health_check().await;
            if !healthy {
                warn!(protocol = %name, "adapter reported unhealthy");
            }
            report.insert(name, healthy);
        }
        report
    }

    /// Cumulative statistics snapshot.
    pub fn stats(&self) -> DistributorStats {
        self.stats.lock().unwrap().clone()
    }

    /// Status snapshot: activity, registered protocols, success rate.
    pub fn status(&self) -> DistributorStatus {
        let stats = self.stats();
        DistributorStatus {
            active: self.is_active(),
            protocols: self.protocols(),
            success_rate: stats.success_rate(),
            stats,
        }
    }
}

impl std::fmt::Debug for UniversalDistributor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UniversalDistributor")
            .field("active", &self.is_active())
            .field("protocols", &self.protocols())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::mocks::MockAdapter;
    use serde_json::json;

    fn distributor() -> UniversalDistributor {
        UniversalDistributor::new(DistributorSection::default())
    }

    fn target(protocol: &str) -> DistributionTarget {
        DistributionTarget::new(protocol, json!({}))
    }

    #[test]
    fn test_register_protocol_mismatch_is_an_error() {
        let dist = distributor();
        let http_adapter = Arc::new(MockAdapter::succeeding("http"));
        let err = dist.register_protocol("mqtt", http_adapter).unwrap_err();
        assert!(matches!(err, DistributorError::ProtocolMismatch { .. }));

        let mqtt_adapter = Arc::new(MockAdapter::succeeding("mqtt"));
        assert!(dist.register_protocol("mqtt", mqtt_adapter).is_ok());
    }

    #[test]
    fn test_unregister_protocol() {
        let dist = distributor();
        dist.register_protocol("mqtt", Arc::new(MockAdapter::succeeding("mqtt")))
            .unwrap();
        assert!(dist.unregister_protocol("mqtt"));
        assert!(!dist.unregister_protocol("mqtt"));
    }

    #[test]
    fn test_registry_survives_stop() {
        let dist = distributor();
        dist.register_protocol("mqtt", Arc::new(MockAdapter::succeeding("mqtt")))
            .unwrap();
        dist.start();
        dist.stop();
        assert_eq!(dist.protocols(), vec!["mqtt".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_options_retry_transient_failures() {
        let dist = distributor();
        let adapter = Arc::new(MockAdapter::failing_n_times("mqtt", 1));
        dist.register_protocol("mqtt", adapter.clone()).unwrap();
        dist.start();

        let result = dist
            .distribute(
                &json!({"x": 1}),
                &[target("mqtt")],
                &DistributeOptions::default(),
            )
            .await;

        // Default options retry, so one transient failure still succeeds
        assert!(result.success);
        assert_eq!(adapter.send_count(), 2);
    }

    #[tokio::test]
    async fn test_inactive_distributor_fails_all_targets_without_calling_adapters() {
        let dist = distributor();
        let adapter = Arc::new(MockAdapter::succeeding("mqtt"));
        dist.register_protocol("mqtt", adapter.clone()).unwrap();

        let targets = vec![target("mqtt"), target("mqtt")];
        let result = dist
            .distribute(&json!({"x": 1}), &targets, &DistributeOptions::new())
            .await;

        assert!(!result.success);
        assert_eq!(result.results.len(), 2);
        for r in &result.results {
            assert_eq!(r.code, Some(ErrorCode::DistributorInactive));
        }
        assert_eq!(adapter.send_count(), 0);
    }

    #[tokio::test]
    async fn test_results_length_equals_targets_length() {
        let dist = distributor();
        dist.register_protocol("mqtt", Arc::new(MockAdapter::succeeding("mqtt")))
            .unwrap();
        dist.start();

        for n in [0usize, 1, 3, 12] {
            let targets: Vec<_> = (0..n).map(|_| target("mqtt")).collect();
            let result = dist
                .distribute(&json!({}), &targets, &DistributeOptions::new())
                .await;
            assert_eq!(result.results.len(), n);
        }
    }

    #[tokio::test]
    async fn test_unknown_protocol_yields_not_found_without_invocation() {
        let dist = distributor();
        let mqtt = Arc::new(MockAdapter::succeeding("mqtt"));
        dist.register_protocol("mqtt", mqtt.clone()).unwrap();
        dist.start();

        let targets = vec![target("mqtt"), target("ftp")];
        let result = dist
            .distribute(&json!({}), &targets, &DistributeOptions::new())
            .await;

        assert!(!result.success);
        assert_eq!(result.results.len(), 2);
        assert!(result.results[0].success);
        assert_eq!(result.results[1].code, Some(ErrorCode::ProtocolNotFound));
        assert_eq!(mqtt.send_count(), 1);
    }

    #[tokio::test]
    async fn test_results_keep_submission_order() {
        let dist = distributor();
        dist.register_protocol("a", Arc::new(MockAdapter::succeeding("a")))
            .unwrap();
        dist.register_protocol("b", Arc::new(MockAdapter::failing("b", "down")))
            .unwrap();
        dist.start();

        let targets = vec![target("a"), target("b"), target("a")];
        let result = dist
            .distribute(&json!({}), &targets, &DistributeOptions::without_retry())
            .await;

        assert_eq!(result.results[0].protocol, "a");
        assert_eq!(result.results[1].protocol, "b");
        assert_eq!(result.results[2].protocol, "a");
        assert!(result.results[0].success);
        assert!(!result.results[1].success);
    }

    #[tokio::test]
    async fn test_retry_disabled_single_attempt() {
        let dist = distributor();
        let adapter = Arc::new(MockAdapter::failing("mqtt", "down"));
        dist.register_protocol("mqtt", adapter.clone()).unwrap();
        dist.start();

        let result = dist
            .distribute(
                &json!({}),
                &[target("mqtt")],
                &DistributeOptions::without_retry(),
            )
            .await;
        assert!(!result.success);
        assert_eq!(adapter.send_count(), 1);
        // Bare failure keeps the adapter's own code, not MAX_RETRIES_EXCEEDED
        assert_ne!(result.results[0].code, Some(ErrorCode::MaxRetriesExceeded));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_enabled_exhausts_budget() {
        let dist = distributor();
        let adapter = Arc::new(MockAdapter::failing("mqtt", "down"));
        dist.register_protocol("mqtt", adapter.clone()).unwrap();
        dist.start();

        let mut options = DistributeOptions::new();
        options.retry_config = Some(RetryConfig {
            max_retries: 2,
            initial_delay_ms: 10,
            backoff_multiplier: 2.0,
        });
        let result = dist.distribute(&json!({}), &[target("mqtt")], &options).await;
        assert_eq!(
            result.results[0].code,
            Some(ErrorCode::MaxRetriesExceeded)
        );
        assert_eq!(adapter.send_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_converts_to_timeout_result() {
        let dist = distributor();
        let adapter = Arc::new(MockAdapter::hanging("slow"));
        dist.register_protocol("slow", adapter).unwrap();
        dist.start();

        let mut options = DistributeOptions::without_retry();
        options.timeout = Some(Duration::from_millis(50));
        let result = dist.distribute(&json!({}), &[target("slow")], &options).await;

        assert!(!result.success);
        assert_eq!(result.results[0].code, Some(ErrorCode::Timeout));
    }

    #[tokio::test]
    async fn test_slow_target_does_not_block_others_beyond_capacity() {
        let dist = distributor();
        dist.register_protocol("fast", Arc::new(MockAdapter::succeeding("fast")))
            .unwrap();
        dist.register_protocol(
            "slow",
            Arc::new(MockAdapter::delayed("slow", Duration::from_millis(200))),
        )
        .unwrap();
        dist.start();

        let mut options = DistributeOptions::without_retry();
        options.concurrency = Some(2);
        // One slow target plus three fast ones: with individually freeing
        // slots the fast ones all finish while the slow one is in flight.
        let targets = vec![target("slow"), target("fast"), target("fast"), target("fast")];
        let started = std::time::Instant::now();
        let result = dist.distribute(&json!({}), &targets, &options).await;
        assert!(result.success);
        // Slots free individually, so the fast targets never wait out the
        // slow one's 200ms
        assert!(started.elapsed() < Duration::from_millis(390));
    }

    #[tokio::test]
    async fn test_stats_accumulate() {
        let dist = distributor();
        dist.register_protocol("mqtt", Arc::new(MockAdapter::succeeding("mqtt")))
            .unwrap();
        dist.start();

        dist.distribute(&json!({}), &[target("mqtt")], &DistributeOptions::new())
            .await;
        dist.distribute(
            &json!({}),
            &[target("mqtt"), target("nope")],
            &DistributeOptions::new(),
        )
        .await;

        let stats = dist.stats();
        assert_eq!(stats.total_distributed, 3);
        assert_eq!(stats.total_successful, 2);
        assert_eq!(stats.total_failed, 1);
        assert!(stats.last_distribution_time.is_some());
    }

    #[tokio::test]
    async fn test_health_check_isolates_failures() {
        let dist = distributor();
        dist.register_protocol("up", Arc::new(MockAdapter::succeeding("up")))
            .unwrap();
        dist.register_protocol("down", Arc::new(MockAdapter::unhealthy("down")))
            .unwrap();

        let report = dist.health_check().await;
        assert_eq!(report.get("up"), Some(&true));
        assert_eq!(report.get("down"), Some(&false));
    }

    #[tokio::test]
    async fn test_status_snapshot() {
        let dist = distributor();
        dist.register_protocol("mqtt", Arc::new(MockAdapter::succeeding("mqtt")))
            .unwrap();
        dist.start();

        let status = dist.status();
        assert!(status.active);
        assert_eq!(status.protocols, vec!["mqtt".to_string()]);
        assert_eq!(status.success_rate, 1.0);
    }
}
