//! Per-target retry with exponential backoff
//!
//! Attempts run `1..=max_retries + 1`. A failed attempt sleeps
//! `initial_delay_ms * multiplier^(attempt-1)` before the next one; once the
//! budget is exhausted the final result carries `MAX_RETRIES_EXCEEDED` with
//! the last underlying failure reason embedded.

use crate::adapter::ProtocolAdapter;
use crate::config::RetryConfig;
use crate::distributor::result::{AdapterResult, Timing};
use crate::error::ErrorCode;
use chrono::Utc;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

/// Backoff delay before attempt `attempt + 1` (1-based attempts).
pub fn backoff_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let factor = config.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
    let millis = (config.initial_delay_ms as f64 * factor).round() as u64;
    Duration::from_millis(millis)
}

/// Run `adapter.send` under the retry policy.
///
/// Adapter-reported failures (`success: false`) are the only failure shape
/// (the contract forbids adapters erroring out of `send`), so every failed
/// attempt is retryable until the budget runs out.
pub async fn execute_with_retry(
    adapter: &dyn ProtocolAdapter,
    data: &Value,
    config: &Value,
    retry: &RetryConfig,
) -> AdapterResult {
    let overall_start = Utc::now();
    let max_attempts = retry.max_retries + 1;
    let mut last_error = String::new();

    for attempt in 1..=max_attempts {
        let result = adapter.send(data, config).await;
        if result.success {
            return result;
        }
        last_error = result
            .error
            .unwrap_or_else(|| "unspecified adapter failure".to_string());

        if attempt < max_attempts {
            let delay = backoff_delay(retry, attempt);
            debug!(
                protocol = adapter.protocol(),
                attempt,
                delay_ms = delay.as_millis() as u64,
                "send failed, backing off before retry"
            );
            tokio::time::sleep(delay).await;
        }
    }

    AdapterResult::failure(
        adapter.protocol(),
        format!(
            "max retries ({}) exceeded, last error: {last_error}",
            retry.max_retries
        ),
        ErrorCode::MaxRetriesExceeded,
        Timing::since(overall_start),
    )
}
