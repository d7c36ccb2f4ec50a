//! Error taxonomy for the distributor and its transports
//!
//! Per-target transport failures are never surfaced as `Err` from
//! `distribute`; they are normalized into `AdapterResult` values carrying an
//! [`ErrorCode`]. The error types here cover the remaining boundaries:
//! programmer errors at registration time and configuration loading.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Wire-facing failure codes attached to per-target results.
///
/// Serialized in SCREAMING_SNAKE_CASE so downstream consumers see the same
/// codes regardless of transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Target references a protocol with no registered adapter.
    ProtocolNotFound,
    /// Retry budget exhausted without a successful attempt.
    MaxRetriesExceeded,
    /// Adapter call exceeded the per-call deadline.
    Timeout,
    /// Distributor was not started when `distribute` was called.
    DistributorInactive,
    /// Transport-level connection establishment failed.
    ConnectionFailed,
    /// Transport-level publish/send failed after a connection existed.
    PublishFailed,
    /// HTTP endpoint answered with a non-success status.
    HttpStatus,
    /// Payload could not be serialized for the wire.
    SerializationFailed,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorCode::ProtocolNotFound => "PROTOCOL_NOT_FOUND",
            ErrorCode::MaxRetriesExceeded => "MAX_RETRIES_EXCEEDED",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::DistributorInactive => "DISTRIBUTOR_INACTIVE",
            ErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            ErrorCode::PublishFailed => "PUBLISH_FAILED",
            ErrorCode::HttpStatus => "HTTP_STATUS",
            ErrorCode::SerializationFailed => "SERIALIZATION_FAILED",
        };
        f.write_str(s)
    }
}

/// Programmer-error conditions raised synchronously by the distributor.
///
/// These are the only failures that surface as `Err` instead of a per-target
/// `AdapterResult`.
#[derive(Debug, Error)]
pub enum DistributorError {
    #[error("adapter protocol {adapter:?} does not match registry key {name:?}")]
    ProtocolMismatch { name: String, adapter: String },

    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),
}

/// Result type for distributor setup operations.
pub type DistributorResult<T> = Result<T, DistributorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_serializes_screaming_snake() {
        let json = serde_json::to_string(&ErrorCode::ProtocolNotFound).unwrap();
        assert_eq!(json, "\"PROTOCOL_NOT_FOUND\"");
        let json = serde_json::to_string(&ErrorCode::MaxRetriesExceeded).unwrap();
        assert_eq!(json, "\"MAX_RETRIES_EXCEEDED\"");
        let json = serde_json::to_string(&ErrorCode::Timeout).unwrap();
        assert_eq!(json, "\"TIMEOUT\"");
    }

    #[test]
    fn test_error_code_display_matches_serde() {
        for code in [
            ErrorCode::ProtocolNotFound,
            ErrorCode::MaxRetriesExceeded,
            ErrorCode::Timeout,
            ErrorCode::DistributorInactive,
            ErrorCode::ConnectionFailed,
            ErrorCode::PublishFailed,
            ErrorCode::HttpStatus,
            ErrorCode::SerializationFailed,
        ] {
            let json = serde_json::to_string(&code).unwrap();
            assert_eq!(json, format!("\"{code}\""));
        }
    }

    #[test]
    fn test_error_code_round_trip() {
        let code: ErrorCode = serde_json::from_str("\"CONNECTION_FAILED\"").unwrap();
        assert_eq!(code, ErrorCode::ConnectionFailed);
    }

    #[test]
    fn test_protocol_mismatch_display() {
        let err = DistributorError::ProtocolMismatch {
            name: "mqtt".to_string(),
            adapter: "http".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("mqtt"));
        assert!(msg.contains("http"));
    }
}
