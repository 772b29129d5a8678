//! In-process AMQP broker
//!
//! Implements `AmqpBackend` entirely in memory: a topic exchange backed by the
//! binding table, FIFO queues with unacknowledged-message tracking, and a
//! static user table for authentication. Queues keep unacked entries in their
//! original positions, so a reattaching consumer sees redeliveries first and
//! newer arrivals after them, in arrival order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::exchange::BindingTable;
use super::{AmqpBackend, AmqpError, ConsumerTag, Delivery, MessageProperties, QueueSpec, Result};

struct StoredMessage {
    routing_key: String,
    payload: Bytes,
    props: MessageProperties,
}

struct QueueEntry {
    msg: StoredMessage,
    /// Delivered at least once without being acknowledged
    delivered: bool,
    /// Tag outstanding on the current consumer, if any
    tag: Option<u64>,
}

struct ActiveConsumer {
    id: u64,
    no_ack: bool,
    tx: mpsc::UnboundedSender<Delivery>,
}

struct QueueState {
    spec: QueueSpec,
    entries: Vec<QueueEntry>,
    consumer: Option<ActiveConsumer>,
    /// Set when the last consumer detaches; drives x-expires reclamation
    idle_since: Option<Instant>,
}

impl QueueState {
    fn expired(&self, now: Instant) -> bool {
        match (self.spec.expires, self.idle_since) {
            (Some(ttl), Some(idle)) => now.duration_since(idle) >= ttl,
            _ => false,
        }
    }
}

/// In-memory topic-exchange broker
pub struct InMemoryBroker {
    users: DashMap<String, Vec<u8>>,
    exchanges: DashMap<String, Arc<RwLock<BindingTable>>>,
    queues: DashMap<String, Arc<Mutex<QueueState>>>,
    next_delivery_tag: AtomicU64,
    next_consumer_id: AtomicU64,
}

impl InMemoryBroker {
    /// Create a broker with the default guest/guest account
    pub fn new() -> Self {
        let broker = Self {
            users: DashMap::new(),
            exchanges: DashMap::new(),
            queues: DashMap::new(),
            next_delivery_tag: AtomicU64::new(1),
            next_consumer_id: AtomicU64::new(1),
        };
        broker.add_user("guest", b"guest");
        broker
    }

    pub fn add_user(&self, username: &str, password: &[u8]) {
        self.users.insert(username.to_string(), password.to_vec());
    }

    /// Look up a live queue, reclaiming it first if its idle TTL elapsed
    fn get_queue(&self, name: &str) -> Option<Arc<Mutex<QueueState>>> {
        let handle = self.queues.get(name)?.clone();
        if handle.lock().expired(Instant::now()) {
            drop(handle);
            self.drop_queue(name);
            return None;
        }
        Some(handle)
    }

    fn drop_queue(&self, name: &str) {
        if self.queues.remove(name).is_some() {
            debug!("queue {} removed", name);
            for exchange in self.exchanges.iter() {
                exchange.value().write().remove_queue(name);
            }
        }
    }

    fn exchange(&self, name: &str) -> Arc<RwLock<BindingTable>> {
        self.exchanges
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(BindingTable::new())))
            .clone()
    }

    /// Push every undelivered entry to the attached consumer, in queue order
    fn flush(&self, queue_name: &str, q: &mut QueueState) {
        let Some(consumer) = q.consumer.as_ref() else {
            return;
        };
        if consumer.tx.is_closed() {
            q.consumer = None;
            q.idle_since = Some(Instant::now());
            return;
        }

        let no_ack = consumer.no_ack;
        let tx = consumer.tx.clone();

        let mut i = 0;
        while i < q.entries.len() {
            if q.entries[i].tag.is_some() {
                // Already outstanding on this consumer
                i += 1;
                continue;
            }

            let tag = self.next_delivery_tag.fetch_add(1, Ordering::Relaxed);
            let delivery = {
                let entry = &mut q.entries[i];
                let redelivered = entry.delivered;
                entry.delivered = true;
                if !no_ack {
                    entry.tag = Some(tag);
                }
                Delivery {
                    routing_key: entry.msg.routing_key.clone(),
                    payload: entry.msg.payload.clone(),
                    props: entry.msg.props,
                    delivery_tag: tag,
                    redelivered,
                }
            };

            if tx.send(delivery).is_err() {
                q.consumer = None;
                q.idle_since = Some(Instant::now());
                return;
            }
            trace!("queue {} delivered tag {}", queue_name, tag);

            if no_ack {
                q.entries.remove(i);
            } else {
                i += 1;
            }
        }
    }

    /// Inspect a queue's declared arguments (queue.declare-passive equivalent)
    pub fn queue_spec(&self, name: &str) -> Option<QueueSpec> {
        self.get_queue(name).map(|q| q.lock().spec)
    }

    /// Number of messages sitting in a queue, unacked ones included
    pub fn queue_depth(&self, name: &str) -> Option<usize> {
        self.get_queue(name).map(|q| q.lock().entries.len())
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.get_queue(name).is_some()
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AmqpBackend for InMemoryBroker {
    async fn authenticate(&self, username: Option<&str>, password: Option<&[u8]>) -> Result<()> {
        let (Some(username), Some(password)) = (username, password) else {
            return Err(AmqpError::AccessRefused);
        };
        match self.users.get(username) {
            Some(stored) if stored.value().as_slice() == password => Ok(()),
            _ => Err(AmqpError::AccessRefused),
        }
    }

    async fn declare_queue(&self, name: &str, spec: QueueSpec) -> Result<()> {
        if let Some(existing) = self.get_queue(name) {
            let q = existing.lock();
            if q.spec != spec {
                return Err(AmqpError::PreconditionFailed(name.to_string()));
            }
            return Ok(());
        }

        debug!(
            "queue {} declared (durable={}, auto_delete={})",
            name, spec.durable, spec.auto_delete
        );
        self.queues.insert(
            name.to_string(),
            Arc::new(Mutex::new(QueueState {
                spec,
                entries: Vec::new(),
                consumer: None,
                idle_since: Some(Instant::now()),
            })),
        );
        Ok(())
    }

    async fn delete_queue(&self, name: &str) -> Result<()> {
        self.drop_queue(name);
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, pattern: &str) -> Result<()> {
        if self.get_queue(queue).is_none() {
            return Err(AmqpError::QueueNotFound(queue.to_string()));
        }
        self.exchange(exchange).write().bind(pattern, queue);
        trace!("bound {} to {} via {}", queue, exchange, pattern);
        Ok(())
    }

    async fn unbind_queue(&self, queue: &str, exchange: &str, pattern: &str) -> Result<()> {
        if let Some(table) = self.exchanges.get(exchange) {
            table.value().write().unbind(pattern, queue);
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Bytes,
        props: MessageProperties,
        _confirm: bool,
    ) -> Result<()> {
        // Routing is synchronous, so returning doubles as the publisher confirm
        let targets = match self.exchanges.get(exchange) {
            Some(table) => table.value().read().matches(routing_key),
            None => return Ok(()),
        };

        for queue_name in targets {
            let Some(handle) = self.get_queue(queue_name.as_str()) else {
                continue;
            };
            let mut q = handle.lock();
            q.entries.push(QueueEntry {
                msg: StoredMessage {
                    routing_key: routing_key.to_string(),
                    payload: payload.clone(),
                    props,
                },
                delivered: false,
                tag: None,
            });
            self.flush(queue_name.as_str(), &mut q);
        }
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        no_ack: bool,
        sink: mpsc::UnboundedSender<Delivery>,
    ) -> Result<ConsumerTag> {
        let handle = self
            .get_queue(queue)
            .ok_or_else(|| AmqpError::QueueNotFound(queue.to_string()))?;

        let id = self.next_consumer_id.fetch_add(1, Ordering::Relaxed);
        let mut q = handle.lock();
        // Replacing a consumer invalidates its outstanding tags
        for entry in q.entries.iter_mut() {
            entry.tag = None;
        }
        q.consumer = Some(ActiveConsumer {
            id,
            no_ack,
            tx: sink,
        });
        q.idle_since = None;
        self.flush(queue, &mut q);

        Ok(ConsumerTag {
            queue: queue.to_string(),
            id,
        })
    }

    async fn cancel(&self, tag: &ConsumerTag) -> Result<()> {
        let Some(handle) = self.get_queue(&tag.queue) else {
            return Ok(());
        };

        let auto_delete = {
            let mut q = handle.lock();
            match q.consumer {
                Some(ref c) if c.id == tag.id => {}
                _ => return Ok(()),
            }
            q.consumer = None;
            q.idle_since = Some(Instant::now());
            for entry in q.entries.iter_mut() {
                entry.tag = None;
            }
            q.spec.auto_delete
        };

        if auto_delete {
            self.drop_queue(&tag.queue);
        }
        Ok(())
    }

    async fn ack(&self, queue: &str, delivery_tag: u64) -> Result<()> {
        let Some(handle) = self.get_queue(queue) else {
            return Ok(());
        };
        let mut q = handle.lock();
        q.entries.retain(|e| e.tag != Some(delivery_tag));
        Ok(())
    }
}
