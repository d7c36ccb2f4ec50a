//! MQTT publish adapter
//!
//! Wraps [`MqttClient`] behind the [`ProtocolAdapter`] trait. The client
//! connects on demand at the first publish, so registering the adapter is
//! cheap even when the broker is down.

use super::{err_result, ok_result, ProtocolAdapter};
use crate::config::MqttSection;
use crate::distributor::result::AdapterResult;
use crate::error::ErrorCode;
use crate::mqtt::{MqttClient, MqttClientConfig, MqttError, QoS};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

pub struct MqttAdapter {
    section: Mutex<MqttSection>,
    client: Mutex<MqttClient>,
}

impl MqttAdapter {
    pub fn new(section: MqttSection) -> Result<Self, crate::config::ConfigError> {
        let client = build_client(&section)?;
        Ok(Self {
            section: Mutex::new(section),
            client: Mutex::new(client),
        })
    }

    /// Resolve the full topic for a target: optional `topic_prefix` joined
    /// with the per-target `topic`, falling back to `events` when the target
    /// names none.
    fn full_topic(prefix: &str, config: &Value) -> String {
        let topic = config
            .get("topic")
            .and_then(Value::as_str)
            .unwrap_or("events");
        if prefix.is_empty() {
            topic.to_string()
        } else {
            format!("{}/{}", prefix.trim_end_matches('/'), topic.trim_start_matches('/'))
        }
    }

    pub async fn disconnect(&self) {
        self.client.lock().await.disconnect().await;
    }
}

fn build_client(section: &MqttSection) -> Result<MqttClient, crate::config::ConfigError> {
    let (host, port) = section.broker_addr()?;
    // Unique suffix per client instance keeps broker sessions from colliding
    let client_id = format!("{}-{}", section.client_id, Uuid::new_v4().simple());
    let mut config = MqttClientConfig::new(host, port, client_id);
    config.keep_alive_secs = section.keep_alive_secs;
    if let Some((username, password)) = section.credentials() {
        config.username = Some(username);
        config.password = Some(password);
    }
    config.connect_timeout = Duration::from_secs(10);
    Ok(MqttClient::new(config))
}

fn qos_from_value(raw: u64) -> QoS {
    match raw {
        1 => QoS::AtLeastOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtMostOnce,
    }
}

#[async_trait]
impl ProtocolAdapter for MqttAdapter {
    fn protocol(&self) -> &str {
        "mqtt"
    }

    fn capabilities(&self) -> &[&str] {
        &["pub-sub", "qos", "retained-messages"]
    }

    async fn send(&self, data: &Value, config: &Value) -> AdapterResult {
        let start = Utc::now();
        let section = self.section.lock().await.clone();

        let payload = match serde_json::to_vec(data) {
            Ok(bytes) => Bytes::from(bytes),
            Err(e) => {
                return err_result(
                    self.protocol(),
                    format!("payload serialization failed: {e}"),
                    ErrorCode::SerializationFailed,
                    start,
                );
            }
        };

        let topic = Self::full_topic(&section.topic_prefix, config);
        let qos = config
            .get("qos")
            .and_then(Value::as_u64)
            .map(qos_from_value)
            .unwrap_or_else(|| qos_from_value(u64::from(section.qos)));
        let retain = config
            .get("retain")
            .and_then(Value::as_bool)
            .unwrap_or(section.retain);

        let client = self.client.lock().await.clone();
        match client.publish(&topic, payload, qos, retain).await {
            Ok(()) => {
                debug!(%topic, ?qos, retain, "published event");
                ok_result(
                    self.protocol(),
                    Some(serde_json::json!({"topic": topic})),
                    start,
                )
            }
            Err(e) => {
                let code = match e {
                    MqttError::ConnectionFailed(_)
                    | MqttError::ConnectionRefused(_)
                    | MqttError::ConnAckTimeout
                    | MqttError::NotConnected { .. }
                    | MqttError::Io(_) => ErrorCode::ConnectionFailed,
                    _ => ErrorCode::PublishFailed,
                };
                warn!(%topic, error = %e, "mqtt publish failed");
                err_result(self.protocol(), e.to_string(), code, start)
            }
        }
    }

    async fn health_check(&self) -> bool {
        self.client.lock().await.is_connected()
    }

    async fn configure(&self, config: &Value) -> Result<(), super::AdapterConfigError> {
        let new_section: MqttSection = serde_json::from_value(config.clone())
            .map_err(|e| super::AdapterConfigError::Invalid(e.to_string()))?;

        let mut section = self.section.lock().await;
        let broker_changed = new_section.broker_url != section.broker_url
            || new_section.client_id != section.client_id;
        *section = new_section.clone();
        drop(section);

        // Broker moves require a fresh client; topic/QoS changes do not
        if broker_changed {
            let fresh = build_client(&new_section)
                .map_err(|e| super::AdapterConfigError::Invalid(e.to_string()))?;
            let mut client = self.client.lock().await;
            client.disconnect().await;
            *client = fresh;
        }
        Ok(())
    }
}
