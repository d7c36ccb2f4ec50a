//! Result and metric types produced by the distributor
//!
//! Every adapter invocation yields an [`AdapterResult`], success or failure,
//! never a panic or an escaping error; every `distribute` call yields a
//! [`DistributionResult`] with exactly one entry per target.

use crate::error::ErrorCode;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One delivery destination for a `distribute` call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DistributionTarget {
    /// Must match a registered adapter's protocol name.
    pub protocol: String,
    /// Per-target transport settings, interpreted by the adapter.
    #[serde(default)]
    pub config: serde_json::Value,
    /// Free-form caller annotations; never interpreted by the core.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl DistributionTarget {
    pub fn new(protocol: impl Into<String>, config: serde_json::Value) -> Self {
        Self {
            protocol: protocol.into(),
            config,
            metadata: None,
        }
    }
}

/// Wall-clock timing of one adapter attempt chain.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Timing {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub duration_ms: u64,
}

impl Timing {
    /// Capture a timing window around a closure-free measurement: callers
    /// record `start` up front and call this when done.
    pub fn since(start: DateTime<Utc>) -> Self {
        let end = Utc::now();
        let duration_ms = (end - start).num_milliseconds().max(0) as u64;
        Self {
            start,
            end,
            duration_ms,
        }
    }
}

/// Outcome of one send attempt against one target. Always produced.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AdapterResult {
    pub success: bool,
    pub protocol: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<ErrorCode>,
    pub timing: Timing,
}

impl AdapterResult {
    pub fn success(protocol: impl Into<String>, data: Option<serde_json::Value>, timing: Timing) -> Self {
        Self {
            success: true,
            protocol: protocol.into(),
            data,
            error: None,
            code: None,
            timing,
        }
    }

    pub fn failure(
        protocol: impl Into<String>,
        error: impl Into<String>,
        code: ErrorCode,
        timing: Timing,
    ) -> Self {
        Self {
            success: false,
            protocol: protocol.into(),
            data: None,
            error: Some(error.into()),
            code: Some(code),
            timing,
        }
    }
}

/// Aggregate metrics for one `distribute` call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DistributionMetrics {
    pub total_targets: usize,
    pub successful_targets: usize,
    pub failed_targets: usize,
    pub total_duration_ms: u64,
    pub average_duration_ms: u64,
}

/// Aggregated outcome of one `distribute` call.
///
/// Invariant: `results.len()` equals the number of targets passed in,
/// regardless of how many succeeded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DistributionResult {
    pub success: bool,
    pub results: Vec<AdapterResult>,
    pub metrics: DistributionMetrics,
}

impl DistributionResult {
    /// Aggregate per-target results into the call-level result.
    pub fn from_results(results: Vec<AdapterResult>, total_duration_ms: u64) -> Self {
        let total_targets = results.len();
        let successful_targets = results.iter().filter(|r| r.success).count();
        let failed_targets = total_targets - successful_targets;
        let average_duration_ms = if total_targets == 0 {
            0
        } else {
            total_duration_ms / total_targets as u64
        };
        Self {
            success: failed_targets == 0,
            results,
            metrics: DistributionMetrics {
                total_targets,
                successful_targets,
                failed_targets,
                total_duration_ms,
                average_duration_ms,
            },
        }
    }
}

/// Cumulative distributor statistics across `distribute` calls.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DistributorStats {
    pub total_distributed: u64,
    pub total_successful: u64,
    pub total_failed: u64,
    pub last_distribution_time: Option<DateTime<Utc>>,
}

impl DistributorStats {
    /// Cumulative per-target success rate in [0.0, 1.0].
    pub fn success_rate(&self) -> f64 {
        let total = self.total_successful + self.total_failed;
        if total == 0 {
            return 1.0;
        }
        self.total_successful as f64 / total as f64
    }
}

/// Snapshot returned by `UniversalDistributor::status`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DistributorStatus {
    pub active: bool,
    pub protocols: Vec<String>,
    pub stats: DistributorStats,
    pub success_rate: f64,
}
