//! Retained message store
//!
//! One retained message per topic, last write wins. Publishing a retained
//! message with an empty payload clears the topic's entry. Entries are read
//! at subscribe time only; the store is never consulted when a persistent
//! session resumes.

use bytes::Bytes;
use dashmap::DashMap;
use tracing::debug;

use crate::protocol::QoS;
use crate::topic::topic_matches_filter;

/// A message held for future subscribers
#[derive(Debug, Clone)]
pub struct RetainedMessage {
    pub topic: String,
    pub payload: Bytes,
    /// QoS the message was published with; capped by the subscription QoS
    /// when delivered
    pub qos: QoS,
}

/// Concurrent map of topic to its retained message
#[derive(Debug, Default)]
pub struct RetainStore {
    entries: DashMap<String, RetainedMessage>,
}

impl RetainStore {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Record a retained publish, replacing any previous entry
    ///
    /// An empty payload deletes the entry instead of storing it.
    pub fn set(&self, topic: &str, payload: Bytes, qos: QoS) {
        if payload.is_empty() {
            if self.entries.remove(topic).is_some() {
                debug!("retained message cleared for {}", topic);
            }
            return;
        }

        self.entries.insert(
            topic.to_string(),
            RetainedMessage {
                topic: topic.to_string(),
                payload,
                qos,
            },
        );
    }

    /// Retained messages whose topic matches the given filter
    pub fn matching(&self, filter: &str) -> Vec<RetainedMessage> {
        self.entries
            .iter()
            .filter(|entry| topic_matches_filter(entry.key(), filter))
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
