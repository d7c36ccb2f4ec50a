//! WebSocket broadcast adapter
//!
//! Runs a small warp server; every connected client receives every payload
//! sent through the adapter. `send` succeeds as long as the payload enters
//! the broadcast channel; zero connected clients is not a delivery failure
//! for a broadcast transport.

use super::{err_result, ok_result, ProtocolAdapter};
use crate::config::WebSocketSection;
use crate::distributor::result::AdapterResult;
use crate::error::ErrorCode;
use async_trait::async_trait;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use warp::Filter;

const BROADCAST_CAPACITY: usize = 256;

pub struct WebSocketAdapter {
    section: WebSocketSection,
    tx: broadcast::Sender<String>,
    connections: Arc<AtomicUsize>,
    server: Mutex<Option<JoinHandle<()>>>,
}

impl WebSocketAdapter {
    pub fn new(section: WebSocketSection) -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            section,
            tx,
            connections: Arc::new(AtomicUsize::new(0)),
            server: Mutex::new(None),
        }
    }

    /// Bind the listener and start accepting clients. Returns the bound
    /// address (useful when configured with port 0).
    pub async fn start(&self) -> Result<std::net::SocketAddr, String> {
        let mut server = self.server.lock().await;
        if server.is_some() {
            return Err("websocket server already running".to_string());
        }

        let tx = self.tx.clone();
        let connections = self.connections.clone();
        let max_connections = self.section.max_connections;

        let route = warp::path("ws").and(warp::ws()).map(move |ws: warp::ws::Ws| {
            let rx = tx.subscribe();
            let connections = connections.clone();
            ws.on_upgrade(move |socket| async move {
                if connections.fetch_add(1, Ordering::SeqCst) >= max_connections {
                    connections.fetch_sub(1, Ordering::SeqCst);
                    warn!("rejecting websocket client: connection limit reached");
                    return;
                }
                client_loop(socket, rx).await;
                connections.fetch_sub(1, Ordering::SeqCst);
            })
        });

        let host: std::net::IpAddr = self
            .section
            .host
            .parse()
            .map_err(|e| format!("invalid bind host {:?}: {e}", self.section.host))?;
        let (addr, serve) = warp::serve(route)
            .try_bind_ephemeral((host, self.section.port))
            .map_err(|e| format!("websocket bind failed: {e}"))?;
        *server = Some(tokio::spawn(serve));
        info!(%addr, "websocket broadcast server listening");
        Ok(addr)
    }

    pub async fn stop(&self) {
        if let Some(handle) = self.server.lock().await.take() {
            handle.abort();
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

async fn client_loop(socket: warp::ws::WebSocket, mut rx: broadcast::Receiver<String>) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    loop {
        tokio::select! {
            broadcasted = rx.recv() => match broadcasted {
                Ok(text) => {
                    if ws_tx.send(warp::ws::Message::text(text)).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "slow websocket client skipped messages");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            inbound = ws_rx.next() => match inbound {
                // Inbound frames are ignored; this is a one-way broadcast
                Some(Ok(_)) => continue,
                _ => break,
            },
        }
    }
}

#[async_trait]
impl ProtocolAdapter for WebSocketAdapter {
    fn protocol(&self) -> &str {
        "websocket"
    }

    fn capabilities(&self) -> &[&str] {
        &["broadcast", "real-time", "bidirectional"]
    }

    async fn send(&self, data: &Value, _config: &Value) -> AdapterResult {
        let start = Utc::now();
        let text = match serde_json::to_string(data) {
            Ok(text) => text,
            Err(e) => {
                return err_result(
                    self.protocol(),
                    format!("payload serialization failed: {e}"),
                    ErrorCode::SerializationFailed,
                    start,
                );
            }
        };
        // A send with no receivers still succeeds: broadcast semantics
        let receivers = self.tx.send(text).unwrap_or(0);
        ok_result(
            self.protocol(),
            Some(serde_json::json!({"clients": receivers})),
            start,
        )
    }

    async fn health_check(&self) -> bool {
        self.server
            .lock()
            .await
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }
}
