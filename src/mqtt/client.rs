//! MQTT 3.1.1 client over TCP
//!
//! Owns one socket per client and drives the CONNECT handshake, the inbound
//! read loop, keep-alive pings, and routing of received PUBLISH packets to
//! the subscription manager. State transitions follow
//! `disconnected → connecting → connected → disconnecting → disconnected`;
//! any socket error or close forces `disconnected` regardless of prior state.

use super::packet::{
    build_connect, build_disconnect, build_pingreq, build_puback, build_publish, build_subscribe,
    build_unsubscribe, parse_packet, ConnectOptions, IncomingPacket, PacketError, PublishOptions,
    QoS,
};
use super::subscription::{
    MessageHandler, MqttMessage, SubscriptionError, SubscriptionHandle, SubscriptionManager,
};
use bytes::{Bytes, BytesMut};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Connection state for the MQTT client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// MQTT transport errors.
#[derive(Debug, Error)]
pub enum MqttError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("broker refused connection with return code {0}")]
    ConnectionRefused(u8),
    #[error("CONNACK timeout - no connection confirmation received")]
    ConnAckTimeout,
    #[error("not connected - current state: {state:?}")]
    NotConnected { state: ConnectionState },
    #[error("publish failed: {0}")]
    PublishFailed(String),
    #[error("wire protocol error: {0}")]
    Protocol(#[from] PacketError),
    #[error("invalid subscription: {0}")]
    Subscription(#[from] SubscriptionError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Connection settings for one client instance.
#[derive(Debug, Clone)]
pub struct MqttClientConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive_secs: u16,
    pub clean_session: bool,
    /// Deadline for the CONNECT/CONNACK handshake.
    pub connect_timeout: Duration,
}

impl MqttClientConfig {
    pub fn new(host: impl Into<String>, port: u16, client_id: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            client_id: client_id.into(),
            username: None,
            password: None,
            keep_alive_secs: 60,
            clean_session: true,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

struct ClientShared {
    config: MqttClientConfig,
    state_tx: watch::Sender<ConnectionState>,
    state_rx: watch::Receiver<ConnectionState>,
    writer: Mutex<Option<OwnedWriteHalf>>,
    subscriptions: SubscriptionManager,
    next_packet_id: AtomicU16,
    reader_handle: Mutex<Option<JoinHandle<()>>>,
    keepalive_handle: Mutex<Option<JoinHandle<()>>>,
    // CONNACK return code for the in-flight handshake. A oneshot rather
    // than the state watch: the watch only keeps the latest value, so a
    // broker that accepts and then immediately closes the socket could
    // overwrite Connected with Disconnected before the waiter observes it.
    // Dropped on teardown so a closed socket wakes the waiter with an error.
    handshake_tx: Mutex<Option<oneshot::Sender<u8>>>,
    // Serializes concurrent connect() callers
    connect_lock: Mutex<()>,
}

/// Asynchronous MQTT 3.1.1 client. Cheap to clone; all clones share one
/// socket and one subscription table.
#[derive(Clone)]
pub struct MqttClient {
    shared: Arc<ClientShared>,
}

impl MqttClient {
    pub fn new(config: MqttClientConfig) -> Self {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        Self {
            shared: Arc::new(ClientShared {
                config,
                state_tx,
                state_rx,
                writer: Mutex::new(None),
                subscriptions: SubscriptionManager::new(),
                next_packet_id: AtomicU16::new(1),
                reader_handle: Mutex::new(None),
                keepalive_handle: Mutex::new(None),
                handshake_tx: Mutex::new(None),
                connect_lock: Mutex::new(()),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state_rx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn subscriptions(&self) -> &SubscriptionManager {
        &self.shared.subscriptions
    }

    /// Next packet identifier: wrapping 16-bit counter, skipping the
    /// reserved value 0.
    fn next_packet_id(&self) -> u16 {
        loop {
            let id = self.shared.next_packet_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    /// Open the TCP connection and complete the CONNECT/CONNACK handshake.
    ///
    /// Idempotent: returns `Ok(())` immediately when already connected.
    pub async fn connect(&self) -> Result<(), MqttError> {
        let _guard = self.shared.connect_lock.lock().await;
        if self.is_connected() {
            return Ok(());
        }

        let _ = self.shared.state_tx.send(ConnectionState::Connecting);
        let addr = (self.shared.config.host.as_str(), self.shared.config.port);
        let stream = TcpStream::connect(addr).await.map_err(|e| {
            let _ = self.shared.state_tx.send(ConnectionState::Disconnected);
            MqttError::ConnectionFailed(e.to_string())
        })?;
        let (read_half, write_half) = stream.into_split();
        *self.shared.writer.lock().await = Some(write_half);

        let (connack_tx, connack_rx) = oneshot::channel();
        *self.shared.handshake_tx.lock().await = Some(connack_tx);

        // Spawn the read loop before sending CONNECT so CONNACK is never missed
        let reader = tokio::spawn(Self::read_loop(
            self.shared.clone(),
            read_half,
        ));
        *self.shared.reader_handle.lock().await = Some(reader);

        let connect = build_connect(&ConnectOptions {
            client_id: self.shared.config.client_id.clone(),
            username: self.shared.config.username.clone(),
            password: self.shared.config.password.clone(),
            clean_session: self.shared.config.clean_session,
            keep_alive_secs: self.shared.config.keep_alive_secs,
        })?;
        if let Err(e) = self.write_packet(connect).await {
            self.teardown().await;
            return Err(e);
        }

        self.wait_for_connack(connack_rx).await?;

        // Keep-alive pings for the lifetime of this connection
        if self.shared.config.keep_alive_secs > 0 {
            let shared = self.shared.clone();
            let interval = Duration::from_secs(self.shared.config.keep_alive_secs as u64);
            let handle = tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await; // first tick fires immediately
                loop {
                    ticker.tick().await;
                    if *shared.state_tx.borrow() != ConnectionState::Connected {
                        break;
                    }
                    let mut writer = shared.writer.lock().await;
                    if let Some(w) = writer.as_mut() {
                        use tokio::io::AsyncWriteExt;
                        if w.write_all(&build_pingreq()).await.is_err() {
                            break;
                        }
                    } else {
                        break;
                    }
                }
            });
            *self.shared.keepalive_handle.lock().await = Some(handle);
        }

        info!(
            host = %self.shared.config.host,
            port = self.shared.config.port,
            client_id = %self.shared.config.client_id,
            "MQTT connection established"
        );
        Ok(())
    }

    async fn wait_for_connack(&self, connack_rx: oneshot::Receiver<u8>) -> Result<(), MqttError> {
        match tokio::time::timeout(self.shared.config.connect_timeout, connack_rx).await {
            // Accepted. The broker may drop the socket right after, which
            // flips the state to Disconnected, but the handshake itself
            // succeeded.
            Ok(Ok(0)) => Ok(()),
            Ok(Ok(code)) => {
                self.teardown().await;
                Err(MqttError::ConnectionRefused(code))
            }
            // Sender dropped: the socket closed before CONNACK arrived
            Ok(Err(_)) => {
                self.teardown().await;
                Err(MqttError::ConnectionFailed(
                    "connection closed during handshake".to_string(),
                ))
            }
            Err(_) => {
                self.teardown().await;
                Err(MqttError::ConnAckTimeout)
            }
        }
    }

    /// Publish a message, connecting on demand if necessary.
    pub async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> Result<(), MqttError> {
        if !self.is_connected() {
            self.connect().await?;
        }
        let packet_id = if qos == QoS::AtMostOnce {
            0
        } else {
            self.next_packet_id()
        };
        let packet = build_publish(&PublishOptions {
            topic: topic.to_string(),
            payload,
            qos,
            retain,
            packet_id,
        })?;
        self.write_packet(packet)
            .await
            .map_err(|e| MqttError::PublishFailed(e.to_string()))
    }

    /// Register a handler and send SUBSCRIBE for its topic filters.
    pub async fn subscribe(
        &self,
        topics: Vec<String>,
        handler: MessageHandler,
        qos: QoS,
    ) -> Result<SubscriptionHandle, MqttError> {
        let handle = self.shared.subscriptions.add(topics.clone(), handler, qos)?;
        if self.is_connected() {
            let entries: Vec<(String, QoS)> = topics.into_iter().map(|t| (t, qos)).collect();
            let packet = build_subscribe(self.next_packet_id(), &entries)?;
            self.write_packet(packet).await?;
        }
        Ok(handle)
    }

    /// Remove overlapping subscriptions and send UNSUBSCRIBE for the topics.
    pub async fn unsubscribe(&self, topics: Vec<String>) -> Result<usize, MqttError> {
        let removed = self.shared.subscriptions.remove(&topics);
        if self.is_connected() && !topics.is_empty() {
            let packet = build_unsubscribe(self.next_packet_id(), &topics)?;
            self.write_packet(packet).await?;
        }
        Ok(removed.len())
    }

    /// Re-issue SUBSCRIBE for every registered topic filter. Intended for
    /// callers re-establishing broker state after a reconnect.
    pub async fn resubscribe_all(&self) -> Result<(), MqttError> {
        let entries = self.shared.subscriptions.filters();
        if entries.is_empty() || !self.is_connected() {
            return Ok(());
        }
        let packet = build_subscribe(self.next_packet_id(), &entries)?;
        self.write_packet(packet).await
    }

    /// Graceful disconnect: best-effort DISCONNECT packet, then socket close.
    pub async fn disconnect(&self) {
        if self.state() == ConnectionState::Disconnected {
            return;
        }
        let _ = self.shared.state_tx.send(ConnectionState::Disconnecting);
        if let Err(e) = self.write_packet(build_disconnect()).await {
            warn!(error = %e, "failed to send DISCONNECT, closing socket anyway");
        }
        self.teardown().await;
        info!(client_id = %self.shared.config.client_id, "MQTT connection closed");
    }

    async fn write_packet(&self, bytes: Bytes) -> Result<(), MqttError> {
        use tokio::io::AsyncWriteExt;
        let mut writer = self.shared.writer.lock().await;
        match writer.as_mut() {
            Some(w) => {
                w.write_all(&bytes).await?;
                w.flush().await?;
                Ok(())
            }
            None => Err(MqttError::NotConnected {
                state: self.state(),
            }),
        }
    }

    async fn teardown(&self) {
        *self.shared.writer.lock().await = None;
        *self.shared.handshake_tx.lock().await = None;
        if let Some(handle) = self.shared.keepalive_handle.lock().await.take() {
            handle.abort();
        }
        if let Some(handle) = self.shared.reader_handle.lock().await.take() {
            handle.abort();
        }
        let _ = self.shared.state_tx.send(ConnectionState::Disconnected);
    }

    async fn read_loop(shared: Arc<ClientShared>, mut read_half: tokio::net::tcp::OwnedReadHalf) {
        let mut buf = BytesMut::with_capacity(4096);
        let mut chunk = [0u8; 4096];
        loop {
            match read_half.read(&mut chunk).await {
                Ok(0) => {
                    debug!("broker closed the connection");
                    break;
                }
                Ok(n) => {
                    buf.extend_from_slice(&chunk[..n]);
                    loop {
                        match parse_packet(&mut buf) {
                            Ok(Some(packet)) => Self::handle_packet(&shared, packet).await,
                            Ok(None) => break,
                            Err(e) => {
                                warn!(error = %e, "dropping connection on protocol error");
                                Self::force_disconnect(&shared).await;
                                return;
                            }
                        }
                    }
                }
                Err(e) => {
                    debug!(error = %e, "socket read error");
                    break;
                }
            }
        }
        Self::force_disconnect(&shared).await;
    }

    async fn force_disconnect(shared: &Arc<ClientShared>) {
        *shared.writer.lock().await = None;
        // Wakes any connect() still waiting on CONNACK
        *shared.handshake_tx.lock().await = None;
        if let Some(handle) = shared.keepalive_handle.lock().await.take() {
            handle.abort();
        }
        let _ = shared.state_tx.send(ConnectionState::Disconnected);
    }

    async fn handle_packet(shared: &Arc<ClientShared>, packet: IncomingPacket) {
        match packet {
            IncomingPacket::ConnAck {
                session_present,
                return_code,
            } => {
                if return_code == 0 {
                    debug!(session_present, "CONNACK accepted");
                    let _ = shared.state_tx.send(ConnectionState::Connected);
                } else {
                    warn!(return_code, "CONNACK refused");
                    let _ = shared.state_tx.send(ConnectionState::Disconnected);
                }
                // State first, then wake the connect() waiter
                if let Some(tx) = shared.handshake_tx.lock().await.take() {
                    let _ = tx.send(return_code);
                }
            }
            IncomingPacket::Publish {
                topic,
                payload,
                qos,
                retain,
                packet_id,
            } => {
                // QoS 1 inbound requires an acknowledgement before delivery
                if qos == QoS::AtLeastOnce {
                    if let Some(id) = packet_id {
                        let mut writer = shared.writer.lock().await;
                        if let Some(w) = writer.as_mut() {
                            use tokio::io::AsyncWriteExt;
                            if let Err(e) = w.write_all(&build_puback(id)).await {
                                warn!(error = %e, "failed to send PUBACK");
                            }
                        }
                    }
                }
                let message = MqttMessage {
                    topic,
                    payload,
                    qos,
                    retain,
                };
                let delivered = shared.subscriptions.deliver(&message);
                debug!(topic = %message.topic, delivered, "inbound message delivered");
            }
            IncomingPacket::PubAck { packet_id } => {
                debug!(packet_id, "PUBACK received");
            }
            IncomingPacket::SubAck {
                packet_id,
                return_codes,
            } => {
                if return_codes.iter().any(|&code| code >= 0x80) {
                    warn!(packet_id, ?return_codes, "broker rejected subscription");
                } else {
                    debug!(packet_id, ?return_codes, "SUBACK received");
                }
            }
            IncomingPacket::UnsubAck { packet_id } => {
                debug!(packet_id, "UNSUBACK received");
            }
            IncomingPacket::PingResp => {
                debug!("PINGRESP received");
            }
        }
    }
}

impl std::fmt::Debug for MqttClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttClient")
            .field("client_id", &self.shared.config.client_id)
            .field("state", &self.state())
            .finish()
    }
}
