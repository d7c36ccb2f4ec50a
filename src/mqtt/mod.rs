//! From-scratch MQTT 3.1.1 implementation
//!
//! Three layers, pure to impure: [`packet`] builds and parses wire bytes,
//! [`subscription`] owns the topic-filter → handler table and wildcard
//! matching, and [`client`] drives one TCP socket through the connection
//! state machine.

pub mod client;
pub mod packet;
pub mod subscription;

pub use client::{ConnectionState, MqttClient, MqttClientConfig, MqttError};
pub use packet::{IncomingPacket, PacketError, QoS, MAX_REMAINING_LENGTH};
pub use subscription::{
    MessageHandler, MqttMessage, SubscriptionHandle, SubscriptionManager, SubscriptionStats,
};
