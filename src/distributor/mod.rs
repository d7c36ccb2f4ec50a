//! Universal fan-out distributor
//!
//! [`core`] is the orchestration heart; [`retry`] the per-target backoff
//! executor; [`result`] the value types every call produces.

pub mod core;
pub mod result;
pub mod retry;

pub use core::{DistributeOptions, UniversalDistributor};
pub use result::{
    AdapterResult, DistributionMetrics, DistributionResult, DistributionTarget, DistributorStats,
    DistributorStatus, Timing,
};
