//! Session state and registry
//!
//! A session owns everything scoped to one MQTT client id: its granted
//! subscriptions, its will slot, the consumers attached to its queues, and the
//! QoS 1 deliveries awaiting PUBACK. The registry maps client ids to live
//! sessions and stamps each connection with a unique epoch, so a handle kept
//! by an evicted connection can be told apart from the connection that
//! replaced it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::debug;

use crate::adapter::DeliverySink;
use crate::amqp::{ConsumerTag, QueueSpec};
use crate::protocol::QoS;
use crate::will::WillSlot;

/// Name of the queue backing one (client, QoS level) pair
pub fn subscription_queue_name(client_id: &str, qos: QoS) -> String {
    format!("mqtt-subscription-{}qos{}", client_id, qos as u8)
}

/// What a PUBACK for a given delivery id should acknowledge
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckTarget {
    /// A queued message; the PUBACK turns into a broker ack
    Broker { queue: String, delivery_tag: u64 },
    /// A message delivered outside any queue (retained at subscribe time)
    Local,
}

/// Live state for one connected (or resumable) client
pub struct Session {
    pub client_id: Arc<str>,
    pub clean_session: bool,
    /// Stamp of the connection this session belongs to
    pub epoch: u64,
    subscriptions: HashMap<String, QoS>,
    pub(crate) will: WillSlot,
    pub(crate) sink: Arc<dyn DeliverySink>,
    pub(crate) consumers: Vec<ConsumerTag>,
    pending: HashMap<u64, AckTarget>,
    next_delivery_id: u64,
}

impl Session {
    pub(crate) fn new(
        client_id: Arc<str>,
        clean_session: bool,
        epoch: u64,
        sink: Arc<dyn DeliverySink>,
    ) -> Self {
        Self {
            client_id,
            clean_session,
            epoch,
            subscriptions: HashMap::new(),
            will: WillSlot::new(),
            sink,
            consumers: Vec::new(),
            pending: HashMap::new(),
            next_delivery_id: 1,
        }
    }

    /// Record a granted subscription; returns the previously granted QoS
    pub fn set_subscription(&mut self, filter: &str, qos: QoS) -> Option<QoS> {
        self.subscriptions.insert(filter.to_string(), qos)
    }

    pub fn remove_subscription(&mut self, filter: &str) -> Option<QoS> {
        self.subscriptions.remove(filter)
    }

    pub fn subscription_qos(&self, filter: &str) -> Option<QoS> {
        self.subscriptions.get(filter).copied()
    }

    /// Allocate a delivery id and remember what its PUBACK resolves to
    pub(crate) fn record_pending(&mut self, target: AckTarget) -> u64 {
        let id = self.next_delivery_id;
        self.next_delivery_id += 1;
        self.pending.insert(id, target);
        id
    }

    pub(crate) fn take_pending(&mut self, delivery_id: u64) -> Option<AckTarget> {
        self.pending.remove(&delivery_id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

/// Registry of sessions keyed by client id
pub struct SessionRegistry {
    sessions: DashMap<String, Arc<RwLock<Session>>>,
    /// Idle lifetime applied to durable session queues
    queue_expiry: Duration,
    next_epoch: AtomicU64,
}

impl SessionRegistry {
    pub fn new(queue_expiry: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            queue_expiry,
            next_epoch: AtomicU64::new(1),
        }
    }

    pub fn get(&self, client_id: &str) -> Option<Arc<RwLock<Session>>> {
        self.sessions.get(client_id).map(|s| s.clone())
    }

    /// Remove the session only if it still belongs to the given connection
    ///
    /// A disconnect racing a takeover must not tear down the session that
    /// replaced it.
    pub fn remove_if_epoch(&self, client_id: &str, epoch: u64) -> Option<Arc<RwLock<Session>>> {
        self.sessions
            .remove_if(client_id, |_, s| s.read().epoch == epoch)
            .map(|(_, s)| s)
    }

    /// Create and register a session for a fresh connection
    ///
    /// The insert is atomic: any session already registered under the client
    /// id is displaced in the same map operation and returned, so two
    /// concurrent CONNECTs can never both believe the id was free.
    pub fn create(
        &self,
        client_id: &str,
        clean_session: bool,
        sink: Arc<dyn DeliverySink>,
    ) -> (Arc<RwLock<Session>>, Option<Arc<RwLock<Session>>>) {
        let epoch = self.next_epoch.fetch_add(1, Ordering::Relaxed);
        let session = Arc::new(RwLock::new(Session::new(
            Arc::from(client_id),
            clean_session,
            epoch,
            sink,
        )));
        let displaced = self.sessions.insert(client_id.to_string(), session.clone());
        debug!("session created for {} (epoch {})", client_id, epoch);
        (session, displaced)
    }

    /// Queue arguments for a session's subscription queues
    ///
    /// Clean sessions get transient auto-delete queues; persistent sessions
    /// get durable queues reclaimed after the configured idle expiry.
    pub fn queue_spec(&self, clean_session: bool) -> QueueSpec {
        if clean_session {
            QueueSpec {
                durable: false,
                auto_delete: true,
                expires: None,
            }
        } else {
            QueueSpec {
                durable: true,
                auto_delete: false,
                expires: Some(self.queue_expiry),
            }
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }
}
