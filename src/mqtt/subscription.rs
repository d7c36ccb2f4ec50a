//! Topic subscriptions and wildcard matching
//!
//! Maintains the topic-pattern → handler table for the MQTT client and
//! delivers inbound messages to every matching subscription. Matching is
//! level-aware: `+` matches exactly one topic level, a trailing `#` matches
//! the remainder of the topic including zero additional levels.

use super::packet::QoS;
use bytes::Bytes;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

/// An inbound application message handed to subscription handlers.
#[derive(Debug, Clone, PartialEq)]
pub struct MqttMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

/// Handler invoked for each message matching a subscription's patterns.
pub type MessageHandler = Arc<dyn Fn(MqttMessage) + Send + Sync>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubscriptionError {
    #[error("invalid topic filter {0:?}: '#' must be the final level")]
    MultiLevelNotLast(String),
    #[error("invalid topic filter {0:?}: wildcard must occupy a whole level")]
    PartialWildcard(String),
    #[error("empty topic filter")]
    EmptyFilter,
}

/// Validate an MQTT 3.1.1 topic filter.
///
/// `#` is only legal as the entire final level; `+` must occupy a whole
/// level on its own.
pub fn validate_filter(pattern: &str) -> Result<(), SubscriptionError> {
    if pattern.is_empty() {
        return Err(SubscriptionError::EmptyFilter);
    }
    let levels: Vec<&str> = pattern.split('/').collect();
    for (i, level) in levels.iter().enumerate() {
        if level.contains('#') {
            if *level != "#" {
                return Err(SubscriptionError::PartialWildcard(pattern.to_string()));
            }
            if i != levels.len() - 1 {
                return Err(SubscriptionError::MultiLevelNotLast(pattern.to_string()));
            }
        } else if level.contains('+') && *level != "+" {
            return Err(SubscriptionError::PartialWildcard(pattern.to_string()));
        }
    }
    Ok(())
}

/// Level-by-level wildcard match of `topic` against a validated `pattern`.
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    let mut pattern_levels = pattern.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (pattern_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true, // trailing # matches the rest, including nothing
            (Some("+"), Some(_)) => continue,
            (Some(p), Some(t)) if p == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// One registered subscription: a set of topic filters bound to a handler.
#[derive(Clone)]
struct Subscription {
    id: Uuid,
    topics: Vec<String>,
    handler: MessageHandler,
    qos: QoS,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("topics", &self.topics)
            .field("qos", &self.qos)
            .finish()
    }
}

/// Handle returned from [`SubscriptionManager::add`]; dropping it does not
/// unsubscribe; call [`SubscriptionHandle::unsubscribe`] explicitly.
#[derive(Clone)]
pub struct SubscriptionHandle {
    pub id: Uuid,
    pub topics: Vec<String>,
    pub qos: QoS,
    manager: SubscriptionManager,
}

impl SubscriptionHandle {
    pub fn unsubscribe(&self) -> bool {
        self.manager.remove_by_id(self.id)
    }
}

/// Subscription counts grouped by QoS, for introspection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscriptionStats {
    pub total: usize,
    pub qos0: usize,
    pub qos1: usize,
    pub qos2: usize,
}

/// Thread-safe registry of subscriptions.
///
/// Subscriptions are independent of connection state: they survive
/// reconnects, and re-issuing SUBSCRIBE after a reconnect is the caller's
/// responsibility.
#[derive(Clone, Default)]
pub struct SubscriptionManager {
    inner: Arc<Mutex<HashMap<Uuid, Subscription>>>,
}

impl SubscriptionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a set of topic filters.
    pub fn add(
        &self,
        topics: Vec<String>,
        handler: MessageHandler,
        qos: QoS,
    ) -> Result<SubscriptionHandle, SubscriptionError> {
        for topic in &topics {
            validate_filter(topic)?;
        }
        let id = Uuid::new_v4();
        let subscription = Subscription {
            id,
            topics: topics.clone(),
            handler,
            qos,
        };
        self.inner.lock().unwrap().insert(id, subscription);
        debug!(subscription_id = %id, ?topics, "subscription added");
        Ok(SubscriptionHandle {
            id,
            topics,
            qos,
            manager: self.clone(),
        })
    }

    /// Deliver a message to every matching subscription, higher QoS first.
    ///
    /// A panicking handler is caught and logged; it never aborts delivery to
    /// the remaining subscriptions. Returns the number of handlers invoked.
    pub fn deliver(&self, message: &MqttMessage) -> usize {
        let mut matches: Vec<Subscription> = {
            let table = self.inner.lock().unwrap();
            table
                .values()
                .filter(|sub| sub.topics.iter().any(|p| topic_matches(p, &message.topic)))
                .cloned()
                .collect()
        };
        matches.sort_by(|a, b| b.qos.cmp(&a.qos));

        let delivered = matches.len();
        for sub in matches {
            let handler = sub.handler.clone();
            let msg = message.clone();
            if let Err(panic) = catch_unwind(AssertUnwindSafe(move || handler(msg))) {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                warn!(
                    subscription_id = %sub.id,
                    topic = %message.topic,
                    %reason,
                    "subscription handler panicked, continuing delivery"
                );
            }
        }
        delivered
    }

    /// Remove a subscription by its id.
    pub fn remove_by_id(&self, id: Uuid) -> bool {
        self.inner.lock().unwrap().remove(&id).is_some()
    }

    /// Remove any subscription whose topic set overlaps the given topics,
    /// by exact string or by wildcard match in either direction.
    ///
    /// Returns the ids of removed subscriptions.
    pub fn remove(&self, topics: &[String]) -> Vec<Uuid> {
        let mut table = self.inner.lock().unwrap();
        let doomed: Vec<Uuid> = table
            .values()
            .filter(|sub| {
                sub.topics.iter().any(|own| {
                    topics.iter().any(|other| {
                        own == other || topic_matches(own, other) || topic_matches(other, own)
                    })
                })
            })
            .map(|sub| sub.id)
            .collect();
        for id in &doomed {
            table.remove(id);
        }
        doomed
    }

    /// Drop all subscriptions.
    pub fn clear(&self) {
        self.inner.lock().unwrap().clear();
    }

    /// The distinct topic filters across all subscriptions.
    pub fn topics(&self) -> Vec<String> {
        let table = self.inner.lock().unwrap();
        let mut topics: Vec<String> = table
            .values()
            .flat_map(|sub| sub.topics.iter().cloned())
            .collect();
        topics.sort();
        topics.dedup();
        topics
    }

    /// The distinct topic filters paired with the QoS to request for each.
    ///
    /// When the same filter appears in multiple subscriptions the highest
    /// requested QoS wins, so a resubscribe never downgrades delivery.
    pub fn filters(&self) -> Vec<(String, QoS)> {
        let table = self.inner.lock().unwrap();
        let mut by_filter: HashMap<String, QoS> = HashMap::new();
        for sub in table.values() {
            for topic in &sub.topics {
                let qos = by_filter.entry(topic.clone()).or_insert(sub.qos);
                if sub.qos > *qos {
                    *qos = sub.qos;
                }
            }
        }
        let mut filters: Vec<(String, QoS)> = by_filter.into_iter().collect();
        filters.sort_by(|a, b| a.0.cmp(&b.0));
        filters
    }

    pub fn stats(&self) -> SubscriptionStats {
        let table = self.inner.lock().unwrap();
        let mut stats = SubscriptionStats {
            total: table.len(),
            ..Default::default()
        };
        for sub in table.values() {
            match sub.qos {
                QoS::AtMostOnce => stats.qos0 += 1,
                QoS::AtLeastOnce => stats.qos1 += 1,
                QoS::ExactlyOnce => stats.qos2 += 1,
            }
        }
        stats
    }
}

impl std::fmt::Debug for SubscriptionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("SubscriptionManager")
            .field("total", &stats.total)
            .finish()
    }
}
