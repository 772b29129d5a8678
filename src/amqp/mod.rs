//! AMQP 0-9-1 broker contract
//!
//! The adapter consumes the broker through `AmqpBackend`, a trait covering the
//! primitives the engine needs: authentication, queue lifecycle, topic-exchange
//! bindings, publishing with optional publisher confirms, and consuming with
//! explicit acknowledgement. `InMemoryBroker` is a complete in-process
//! implementation used by the test suite and by embedders running without a
//! broker.

mod exchange;
mod memory;

pub use exchange::BindingTable;
pub use memory::InMemoryBroker;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::protocol::QoS;

/// Broker-side error types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Credentials rejected by the broker's auth backend
    AccessRefused,
    /// Queue redeclared with incompatible arguments
    PreconditionFailed(String),
    /// Operation against a queue that does not exist
    QueueNotFound(String),
    /// Internal broker failure
    Internal(String),
}

impl fmt::Display for AmqpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AccessRefused => write!(f, "access refused"),
            Self::PreconditionFailed(q) => write!(f, "precondition failed on queue {}", q),
            Self::QueueNotFound(q) => write!(f, "queue not found: {}", q),
            Self::Internal(msg) => write!(f, "internal broker error: {}", msg),
        }
    }
}

impl std::error::Error for AmqpError {}

pub type Result<T> = std::result::Result<T, AmqpError>;

/// Arguments a queue is declared with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueSpec {
    /// Queue survives broker restart and consumer disconnect
    pub durable: bool,
    /// Queue is deleted when its last consumer detaches
    pub auto_delete: bool,
    /// Idle lifetime after which the broker reclaims the queue (x-expires)
    pub expires: Option<Duration>,
}

/// Message metadata carried alongside the payload (as AMQP headers would be)
#[derive(Debug, Clone, Copy)]
pub struct MessageProperties {
    /// QoS the message was originally published with
    pub qos: QoS,
    /// Whether the publisher set the retain flag
    pub retained: bool,
}

/// A message pushed to a consumer
#[derive(Debug, Clone)]
pub struct Delivery {
    pub routing_key: String,
    pub payload: Bytes,
    pub props: MessageProperties,
    /// Tag to acknowledge with; meaningless for no-ack consumers
    pub delivery_tag: u64,
    /// True when this message was delivered before and not acknowledged
    pub redelivered: bool,
}

/// Handle identifying an attached consumer
#[derive(Debug, Clone)]
pub struct ConsumerTag {
    pub queue: String,
    pub(crate) id: u64,
}

/// The broker primitives the adapter is built on
///
/// Contract notes:
/// - `declare_queue` on an existing queue with different arguments fails with
///   `PreconditionFailed` rather than silently adopting either spec.
/// - `bind_queue` is idempotent; binding the same pattern twice is a no-op.
/// - `publish` with `confirm` does not return until the broker has routed the
///   message (publisher-confirm semantics).
/// - `cancel` detaches the consumer; unacknowledged messages stay queued in
///   their original positions and are redelivered to the next consumer.
#[async_trait]
pub trait AmqpBackend: Send + Sync {
    async fn authenticate(&self, username: Option<&str>, password: Option<&[u8]>) -> Result<()>;

    async fn declare_queue(&self, name: &str, spec: QueueSpec) -> Result<()>;

    async fn delete_queue(&self, name: &str) -> Result<()>;

    async fn bind_queue(&self, queue: &str, exchange: &str, pattern: &str) -> Result<()>;

    async fn unbind_queue(&self, queue: &str, exchange: &str, pattern: &str) -> Result<()>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Bytes,
        props: MessageProperties,
        confirm: bool,
    ) -> Result<()>;

    async fn consume(
        &self,
        queue: &str,
        no_ack: bool,
        sink: mpsc::UnboundedSender<Delivery>,
    ) -> Result<ConsumerTag>;

    async fn cancel(&self, tag: &ConsumerTag) -> Result<()>;

    async fn ack(&self, queue: &str, delivery_tag: u64) -> Result<()>;
}
