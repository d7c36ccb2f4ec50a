//! Mock implementations for testing
//!
//! Provides a scriptable [`MockAdapter`] so distributor behavior can be
//! exercised without touching real transports.

use crate::adapter::ProtocolAdapter;
use crate::distributor::result::{AdapterResult, Timing};
use crate::error::ErrorCode;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

enum Behavior {
    Succeed,
    Fail(String),
    /// Fail the first `n` sends, then succeed.
    FailFirst(usize),
    /// Sleep for the duration, then succeed.
    Delay(Duration),
    /// Never complete.
    Hang,
}

/// Scriptable adapter double. Counts sends and records the payloads it saw.
pub struct MockAdapter {
    protocol: String,
    behavior: Behavior,
    healthy: bool,
    sends: AtomicUsize,
    seen_payloads: Mutex<Vec<Value>>,
}

impl MockAdapter {
    pub fn succeeding(protocol: &str) -> Self {
        Self::with_behavior(protocol, Behavior::Succeed)
    }

    pub fn failing(protocol: &str, error: &str) -> Self {
        Self::with_behavior(protocol, Behavior::Fail(error.to_string()))
    }

    pub fn failing_n_times(protocol: &str, n: usize) -> Self {
        Self::with_behavior(protocol, Behavior::FailFirst(n))
    }

    pub fn delayed(protocol: &str, delay: Duration) -> Self {
        Self::with_behavior(protocol, Behavior::Delay(delay))
    }

    pub fn hanging(protocol: &str) -> Self {
        Self::with_behavior(protocol, Behavior::Hang)
    }

    pub fn unhealthy(protocol: &str) -> Self {
        let mut adapter = Self::with_behavior(protocol, Behavior::Succeed);
        adapter.healthy = false;
        adapter
    }

    fn with_behavior(protocol: &str, behavior: Behavior) -> Self {
        Self {
            protocol: protocol.to_string(),
            behavior,
            healthy: true,
            sends: AtomicUsize::new(0),
            seen_payloads: Mutex::new(Vec::new()),
        }
    }

    /// How many times `send` was invoked.
    pub fn send_count(&self) -> usize {
        self.sends.load(Ordering::SeqCst)
    }

    /// Payloads passed to `send`, in order.
    pub fn seen_payloads(&self) -> Vec<Value> {
        self.seen_payloads.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProtocolAdapter for MockAdapter {
    fn protocol(&self) -> &str {
        &self.protocol
    }

    fn capabilities(&self) -> &[&str] {
        &["mock"]
    }

    async fn send(&self, data: &Value, _config: &Value) -> AdapterResult {
        let attempt = self.sends.fetch_add(1, Ordering::SeqCst) + 1;
        self.seen_payloads.lock().unwrap().push(data.clone());
        let start = Utc::now();

        match &self.behavior {
            Behavior::Succeed => AdapterResult::success(&self.protocol, None, Timing::since(start)),
            Behavior::Fail(error) => AdapterResult::failure(
                &self.protocol,
                error.clone(),
                ErrorCode::PublishFailed,
                Timing::since(start),
            ),
            Behavior::FailFirst(n) => {
                if attempt <= *n {
                    AdapterResult::failure(
                        &self.protocol,
                        format!("transient failure {attempt}"),
                        ErrorCode::ConnectionFailed,
                        Timing::since(start),
                    )
                } else {
                    AdapterResult::success(&self.protocol, None, Timing::since(start))
                }
            }
            Behavior::Delay(duration) => {
                tokio::time::sleep(*duration).await;
                AdapterResult::success(&self.protocol, None, Timing::since(start))
            }
            Behavior::Hang => {
                futures::future::pending::<()>().await;
                unreachable!()
            }
        }
    }

    async fn health_check(&self) -> bool {
        self.healthy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_counts_sends_and_records_payloads() {
        let adapter = MockAdapter::succeeding("mock");
        let payload = serde_json::json!({"k": "v"});
        let result = adapter.send(&payload, &Value::Null).await;
        assert!(result.success);
        assert_eq!(adapter.send_count(), 1);
        assert_eq!(adapter.seen_payloads(), vec![payload]);
    }

    #[tokio::test]
    async fn test_mock_fail_first_recovers() {
        let adapter = MockAdapter::failing_n_times("mock", 1);
        assert!(!adapter.send(&Value::Null, &Value::Null).await.success);
        assert!(adapter.send(&Value::Null, &Value::Null).await.success);
    }
}
