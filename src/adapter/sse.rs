//! Server-Sent-Events broadcast adapter
//!
//! Same hub shape as the websocket adapter: a warp server streams every
//! payload to each connected client over a long-lived HTTP response.

use super::{err_result, ok_result, ProtocolAdapter};
use crate::config::SseSection;
use crate::distributor::result::AdapterResult;
use crate::error::ErrorCode;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use warp::Filter;

const BROADCAST_CAPACITY: usize = 256;

pub struct SseAdapter {
    section: SseSection,
    tx: broadcast::Sender<String>,
    connections: Arc<AtomicUsize>,
    server: Mutex<Option<JoinHandle<()>>>,
}

impl SseAdapter {
    pub fn new(section: SseSection) -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            section,
            tx,
            connections: Arc::new(AtomicUsize::new(0)),
            server: Mutex::new(None),
        }
    }

    /// Bind the listener and start serving the event stream endpoint.
    pub async fn start(&self) -> Result<std::net::SocketAddr, String> {
        let mut server = self.server.lock().await;
        if server.is_some() {
            return Err("sse server already running".to_string());
        }

        let tx = self.tx.clone();
        let connections = self.connections.clone();
        let max_connections = self.section.max_connections;
        let endpoint = self.section.endpoint.trim_matches('/').to_string();
        let route = warp::path(endpoint)
            .and(warp::get())
            .map(move || -> Box<dyn warp::Reply> {
                if connections.fetch_add(1, Ordering::SeqCst) >= max_connections {
                    connections.fetch_sub(1, Ordering::SeqCst);
                    warn!("rejecting sse client: connection limit reached");
                    return Box::new(warp::reply::with_status(
                        "connection limit reached",
                        warp::http::StatusCode::SERVICE_UNAVAILABLE,
                    ));
                }
                let slot = ConnectionSlot(connections.clone());
                let rx = tx.subscribe();
                let stream = event_stream(rx, slot);
                Box::new(warp::sse::reply(warp::sse::keep_alive().stream(stream)))
            });

        let (addr, serve) = warp::serve(route)
            .try_bind_ephemeral(([0, 0, 0, 0], self.section.port))
            .map_err(|e| format!("sse bind failed: {e}"))?;
        *server = Some(tokio::spawn(serve));
        info!(%addr, endpoint = %self.section.endpoint, "sse broadcast server listening");
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

// Frees the client's slot in the connection count when its stream drops
struct ConnectionSlot(Arc<AtomicUsize>);

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn event_stream(
    rx: broadcast::Receiver<String>,
    slot: ConnectionSlot,
) -> impl futures::Stream<Item = Result<warp::sse::Event, Infallible>> {
    futures::stream::unfold((rx, slot), |(mut rx, slot)| async move {
        loop {
            match rx.recv().await {
                Ok(text) => {
                    let event = warp::sse::Event::default().event("message").data(text);
                    return Some((Ok(event), (rx, slot)));
                }
                // Lagged clients just miss the overwritten events
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
}

#[async_trait]
impl ProtocolAdapter for SseAdapter {
    fn protocol(&self) -> &str {
        "sse"
    }

    fn capabilities(&self) -> &[&str] {
        &["broadcast", "real-time", "http"]
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
