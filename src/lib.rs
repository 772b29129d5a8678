//! MQTT v3.1 session engine backed by an AMQP 0-9-1 topic exchange.
//!
//! This crate is the protocol-independent half of an MQTT adapter: it owns
//! sessions, subscriptions, QoS bookkeeping, retained messages, and wills,
//! and maps them onto AMQP primitives. Topics become routing keys on a topic
//! exchange; each session gets one queue per QoS level, named
//! `mqtt-subscription-<clientId>qos<level>`, so the queue a message lands in
//! decides its delivery guarantee.
//!
//! A wire layer integrates by calling [`Adapter::on_connect`] with a
//! [`DeliverySink`] per accepted connection and forwarding packets to the
//! other `on_*` methods. The broker side is abstracted behind
//! [`amqp::AmqpBackend`]; [`amqp::InMemoryBroker`] is a complete in-process
//! implementation.
//!
//! ```no_run
//! use std::sync::Arc;
//! use mqgate::{Adapter, AdapterConfig};
//! use mqgate::amqp::InMemoryBroker;
//!
//! let adapter = Adapter::new(Arc::new(InMemoryBroker::new()), AdapterConfig::default());
//! ```

pub mod adapter;
pub mod amqp;
pub mod bridge;
pub mod config;
pub mod error;
pub mod protocol;
pub mod retain;
pub mod session;
pub mod topic;
pub mod will;

pub use adapter::{Adapter, ConnectOptions, DeliverySink, SessionHandle};
pub use config::AdapterConfig;
pub use error::{AdapterError, LossCause};
pub use protocol::{OutboundMessage, QoS, WillMessage};
