//! Uniform transport adapter contract
//!
//! Every transport implements [`ProtocolAdapter`] once; the distributor only
//! ever talks to this trait. `send` must absorb ordinary transport failures
//! into a failed [`AdapterResult`]; an `Err`/panic escaping an adapter is a
//! bug, not a delivery failure.

use crate::distributor::result::{AdapterResult, Timing};
use crate::error::ErrorCode;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use thiserror::Error;

pub mod http;
pub mod mqtt;
pub mod sse;
pub mod udp;
pub mod websocket;

pub use http::HttpAdapter;
pub use mqtt::MqttAdapter;
pub use sse::SseAdapter;
pub use udp::UdpAdapter;
pub use websocket::WebSocketAdapter;

/// Error applying new settings through `configure`.
#[derive(Debug, Error)]
pub enum AdapterConfigError {
    #[error("invalid adapter configuration: {0}")]
    Invalid(String),
}

/// Transport adapter contract.
#[async_trait]
pub trait ProtocolAdapter: Send + Sync {
    /// Protocol name; must equal the key this adapter is registered under.
    fn protocol(&self) -> &str;

    /// Static descriptive capability list (e.g. `["pub-sub", "topics"]`).
    /// Introspection only, never used for dispatch decisions.
    fn capabilities(&self) -> &[&str] {
        &[]
    }

    /// Deliver one payload to one target. `config` is the per-target
    /// configuration from the [`DistributionTarget`]; adapters merge it over
    /// their own settings.
    ///
    /// [`DistributionTarget`]: crate::distributor::result::DistributionTarget
    async fn send(&self, data: &Value, config: &Value) -> AdapterResult;

    /// Liveness check; the default means "always healthy".
    async fn health_check(&self) -> bool {
        true
    }

    /// Apply new settings. May force a reconnect when connection-affecting
    /// fields change. Default is a no-op.
    async fn configure(&self, _config: &Value) -> Result<(), AdapterConfigError> {
        Ok(())
    }
}

/// Shorthand for a successful result with standard timing.
pub(crate) fn ok_result(
    protocol: &str,
    data: Option<Value>,
    start: chrono::DateTime<Utc>,
) -> AdapterResult {
    AdapterResult::success(protocol, data, Timing::since(start))
}

/// Shorthand for a failed result with standard timing.
pub(crate) fn err_result(
    protocol: &str,
    error: impl Into<String>,
    code: ErrorCode,
    start: chrono::DateTime<Utc>,
) -> AdapterResult {
    AdapterResult::failure(protocol, error, code, Timing::since(start))
}
