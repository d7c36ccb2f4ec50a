//! eventfan - protocol-agnostic event fan-out
//!
//! A distributor that delivers one JSON payload to many transport targets
//! concurrently, with per-target retry, timeouts, and aggregate statistics.
//! Transports plug in through the [`ProtocolAdapter`] trait; HTTP webhooks,
//! WebSocket and SSE broadcast hubs, UDP datagrams, and MQTT publishing ship
//! built in. The MQTT transport is a from-scratch 3.1.1 client, wire codec
//! included.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use eventfan::adapter::HttpAdapter;
//! use eventfan::config::{DistributorSection, HttpSection};
//! use eventfan::distributor::{DistributeOptions, DistributionTarget, UniversalDistributor};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let distributor = UniversalDistributor::new(DistributorSection::default());
//!
//! let http = HttpAdapter::new(HttpSection {
//!     base_url: "http://localhost:9000".to_string(),
//!     timeout_ms: 5000,
//!     headers: Default::default(),
//!     endpoint: "/events".to_string(),
//! });
//! distributor.register_protocol("http", Arc::new(http))?;
//! distributor.start();
//!
//! let targets = vec![DistributionTarget::new("http", json!({"endpoint": "/gaze"}))];
//! let report = distributor
//!     .distribute(&json!({"x": 0.42, "y": 0.17}), &targets, &DistributeOptions::new())
//!     .await;
//! assert_eq!(report.results.len(), targets.len());
//! # Ok(())
//! # }
//! ```

pub mod adapter;
pub mod config;
pub mod distributor;
pub mod error;
pub mod mqtt;
pub mod observability;
pub mod testing;

pub use adapter::ProtocolAdapter;
pub use config::DistributorConfig;
pub use distributor::{
    AdapterResult, DistributeOptions, DistributionResult, DistributionTarget, DistributorStats,
    UniversalDistributor,
};
pub use error::{DistributorError, ErrorCode};
pub use mqtt::{MqttClient, MqttClientConfig, QoS};
