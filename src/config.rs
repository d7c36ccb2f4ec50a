//! Configuration for the distributor and its protocol adapters
//!
//! Loaded from TOML. Field-level validation (ports in range, URLs
//! well-formed, required fields present) is the job of the layer producing
//! these files; loading here only deserializes, applies defaults, and
//! resolves credential indirection through environment variables.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Top-level configuration. Every protocol section is optional; an absent
/// section simply means that adapter is never constructed from config.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DistributorConfig {
    #[serde(default)]
    pub distributor: DistributorSection,
    pub http: Option<HttpSection>,
    pub websocket: Option<WebSocketSection>,
    pub mqtt: Option<MqttSection>,
    pub udp: Option<UdpSection>,
    pub sse: Option<SseSection>,
}

/// Fan-out core settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DistributorSection {
    /// Maximum number of targets dispatched concurrently per `distribute` call.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Default per-target retry policy.
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for DistributorSection {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            retry: RetryConfig::default(),
        }
    }
}

fn default_max_concurrency() -> usize {
    5
}

/// Retry/backoff policy for a single target within one `distribute` call.
///
/// The delay before attempt `k+1` is `initial_delay_ms * multiplier^(k-1)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryConfig {
    /// Additional attempts after the first one.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay before the first retry, in milliseconds. Must be positive.
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Exponential growth factor, >= 1.0.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    100
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

/// HTTP webhook adapter settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HttpSection {
    /// Base URL prefixed to per-target endpoints.
    pub base_url: String,
    /// Request timeout in milliseconds.
    #[serde(default = "default_http_timeout_ms")]
    pub timeout_ms: u64,
    /// Static headers added to every request.
    #[serde(default)]
    pub headers: std::collections::HashMap<String, String>,
    /// Default endpoint path when a target supplies none.
    #[serde(default = "default_http_endpoint")]
    pub endpoint: String,
}

fn default_http_timeout_ms() -> u64 {
    5000
}

fn default_http_endpoint() -> String {
    "/events".to_string()
}

/// WebSocket broadcast adapter settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WebSocketSection {
    pub port: u16,
    #[serde(default = "default_bind_host")]
    pub host: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// MQTT adapter settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqttSection {
    /// Broker URL, e.g. `mqtt://localhost:1883`.
    pub broker_url: String,
    /// Client identifier sent in CONNECT. A unique suffix is appended per
    /// connection attempt to avoid broker-side session collisions.
    pub client_id: String,
    /// Environment variable containing the username.
    pub username_env: Option<String>,
    /// Environment variable containing the password.
    pub password_env: Option<String>,
    /// Default QoS for published events (0 or 1).
    #[serde(default)]
    pub qos: u8,
    /// Default retain flag for published events.
    #[serde(default)]
    pub retain: bool,
    /// Prefix joined to per-target topics.
    #[serde(default)]
    pub topic_prefix: String,
    /// Keep-alive interval in seconds.
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u16,
}

fn default_keep_alive_secs() -> u16 {
    60
}

impl MqttSection {
    /// Resolve broker host and port from `broker_url`.
    pub fn broker_addr(&self) -> Result<(String, u16), ConfigError> {
        let url = url::Url::parse(&self.broker_url)
            .map_err(|_| ConfigError::InvalidBrokerUrl(self.broker_url.clone()))?;
        let host = url
            .host_str()
            .ok_or_else(|| ConfigError::InvalidBrokerUrl(self.broker_url.clone()))?
            .to_string();
        let port = url.port().unwrap_or(1883);
        Ok((host, port))
    }

    /// Resolve credentials through environment variable indirection.
    /// Missing variables yield `None` rather than an error: anonymous broker
    /// access is a valid deployment.
    pub fn credentials(&self) -> Option<(String, String)> {
        let username = self
            .username_env
            .as_ref()
            .and_then(|name| std::env::var(name).ok())?;
        let password = self
            .password_env
            .as_ref()
            .and_then(|name| std::env::var(name).ok())
            .unwrap_or_default();
        Some((username, password))
    }
}

/// UDP datagram adapter settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UdpSection {
    /// Local bind port (0 picks an ephemeral port).
    #[serde(default)]
    pub port: u16,
    #[serde(default = "default_bind_host")]
    pub host: String,
    /// Maximum datagram payload in bytes.
    #[serde(default = "default_udp_max_payload")]
    pub max_payload: usize,
    /// Destinations every send is copied to.
    #[serde(default)]
    pub targets: Vec<UdpTarget>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UdpTarget {
    pub host: String,
    pub port: u16,
}

fn default_udp_max_payload() -> usize {
    65_507
}

/// Server-Sent-Events adapter settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SseSection {
    pub port: u16,
    #[serde(default = "default_sse_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

fn default_sse_endpoint() -> String {
    "events".to_string()
}

fn default_bind_host() -> String {
    "0.0.0.0".to_string()
}

fn default_max_connections() -> usize {
    100
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
}

impl DistributorConfig {
    /// Load configuration from a TOML file.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: DistributorConfig = toml::from_str(&content)?;
        Ok(config)
    }
}
