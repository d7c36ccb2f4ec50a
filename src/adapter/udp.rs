//! Raw UDP datagram adapter
//!
//! Serializes the payload to JSON and fires one datagram per configured
//! destination. Fire-and-forget: delivery is whatever the network gives us,
//! which is the point of this transport.

use super::{err_result, ok_result, AdapterConfigError, ProtocolAdapter};
use crate::config::{UdpSection, UdpTarget};
use crate::distributor::result::AdapterResult;
use crate::error::ErrorCode;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use std::sync::RwLock;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tracing::debug;

pub struct UdpAdapter {
    section: RwLock<UdpSection>,
    socket: Mutex<Option<Arc<UdpSocket>>>,
}

impl UdpAdapter {
    pub fn new(section: UdpSection) -> Self {
        Self {
            section: RwLock::new(section),
            socket: Mutex::new(None),
        }
    }

    async fn socket(&self) -> std::io::Result<Arc<UdpSocket>> {
        let mut guard = self.socket.lock().await;
        if let Some(socket) = guard.as_ref() {
            return Ok(socket.clone());
        }
        let (host, port) = {
            let section = self.section.read().unwrap();
            (section.host.clone(), section.port)
        };
        let socket = Arc::new(UdpSocket::bind((host.as_str(), port)).await?);
        *guard = Some(socket.clone());
        Ok(socket)
    }

    /// Destinations: target-level `targets` override the configured list.
    fn destinations(&self, config: &Value) -> Vec<UdpTarget> {
        if let Some(list) = config.get("targets") {
            if let Ok(targets) = serde_json::from_value::<Vec<UdpTarget>>(list.clone()) {
                return targets;
            }
        }
        self.section.read().unwrap().targets.clone()
    }
}

#[async_trait]
impl ProtocolAdapter for UdpAdapter {
    fn protocol(&self) -> &str {
        "udp"
    }

    fn capabilities(&self) -> &[&str] {
        &["datagram", "fire-and-forget", "multi-target"]
    }

    async fn send(&self, data: &Value, config: &Value) -> AdapterResult {
        let start = Utc::now();

        let payload = match serde_json::to_vec(data) {
            Ok(bytes) => bytes,
            Err(e) => {
                return err_result(
                    self.protocol(),
                    format!("payload serialization failed: {e}"),
                    ErrorCode::SerializationFailed,
                    start,
                );
            }
        };

        let max_payload = self.section.read().unwrap().max_payload;
        if payload.len() > max_payload {
            return err_result(
                self.protocol(),
                format!(
                    "payload of {} bytes exceeds datagram limit of {max_payload}",
                    payload.len()
                ),
                ErrorCode::PublishFailed,
                start,
            );
        }

        let destinations = self.destinations(config);
        if destinations.is_empty() {
            return err_result(
                self.protocol(),
                "no UDP destinations configured",
                ErrorCode::PublishFailed,
                start,
            );
        }

        let socket = match self.socket().await {
            Ok(socket) => socket,
            Err(e) => {
                return err_result(
                    self.protocol(),
                    format!("socket bind failed: {e}"),
                    ErrorCode::ConnectionFailed,
                    start,
                );
            }
        };

        let mut sent = 0usize;
        let mut errors = Vec::new();
        for dest in &destinations {
            match socket
                .send_to(&payload, (dest.host.as_str(), dest.port))
                .await
            {
                Ok(_) => sent += 1,
                Err(e) => errors.push(format!("{}:{}: {e}", dest.host, dest.port)),
            }
        }
        debug!(sent, failed = errors.len(), "udp fan-out finished");

        if errors.is_empty() {
            ok_result(
                self.protocol(),
                Some(serde_json::json!({"datagrams_sent": sent})),
                start,
            )
        } else {
            err_result(
                self.protocol(),
                format!("{} of {} datagrams failed: {}", errors.len(), destinations.len(), errors.join("; ")),
                ErrorCode::PublishFailed,
                start,
            )
        }
    }

    async fn configure(&self, config: &Value) -> Result<(), AdapterConfigError> {
        let section: UdpSection = serde_json::from_value(config.clone())
            .map_err(|e| AdapterConfigError::Invalid(e.to_string()))?;
        let rebind = {
            let current = self.section.read().unwrap();
            current.host != section.host || current.port != section.port
        };
        *self.section.write().unwrap() = section;
        if rebind {
            // Bind address changed; drop the socket so the next send rebinds
            *self.socket.lock().await = None;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn section_with_targets(targets: Vec<UdpTarget>) -> UdpSection {
        UdpSection {
            port: 0,
            host: "127.0.0.1".to_string(),
            max_payload: 65_507,
            targets,
        }
    }

    #[tokio::test]
    async fn test_datagram_reaches_listener() {
        let listener = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let adapter = UdpAdapter::new(section_with_targets(vec![UdpTarget {
            host: "127.0.0.1".to_string(),
            port,
        }]));

        let payload = json!({"gaze": {"x": 0.5, "y": 0.2}});
        let result = adapter.send(&payload, &json!({})).await;
        assert!(result.success);
        assert_eq!(result.data.unwrap()["datagrams_sent"], 1);

        let mut buf = [0u8; 1024];
        let (n, _) = listener.recv_from(&mut buf).await.unwrap();
        let received: Value = serde_json::from_slice(&buf[..n]).unwrap();
        assert_eq!(received, payload);
    }

    #[tokio::test]
    async fn test_no_destinations_is_failure() {
        let adapter = UdpAdapter::new(section_with_targets(vec![]));
        let result = adapter.send(&json!({}), &json!({})).await;
        assert!(!result.success);
        assert_eq!(result.code, Some(ErrorCode::PublishFailed));
    }

    #[tokio::test]
    async fn test_oversize_payload_rejected() {
        let mut section = section_with_targets(vec![UdpTarget {
            host: "127.0.0.1".to_string(),
            port: 1,
        }]);
        section.max_payload = 8;
        let adapter = UdpAdapter::new(section);
        let result = adapter
            .send(&json!({"big": "0123456789abcdef"}), &json!({}))
            .await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("datagram limit"));
    }

    #[tokio::test]
    async fn test_target_config_overrides_destinations() {
        let listener = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        // Configured with nothing; the target supplies the destination
        let adapter = UdpAdapter::new(section_with_targets(vec![]));
        let result = adapter
            .send(
                &json!({"n": 1}),
                &json!({"targets": [{"host": "127.0.0.1", "port": port}]}),
            )
            .await;
        assert!(result.success);
    }
}
