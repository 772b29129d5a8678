//! Adapter error types

use std::fmt;

use crate::amqp::AmqpError;

/// Errors surfaced across the adapter's public API
#[derive(Debug)]
pub enum AdapterError {
    /// Bad or missing credentials - reported to the client at CONNECT
    Authentication,
    /// Clean/durable flag mismatch against an existing session queue
    SessionCollision(String),
    /// Operation violates the protocol state machine
    ProtocolViolation(&'static str),
    /// Downstream delivery callback failed; the message remains pending
    Delivery,
    /// Ungraceful connection loss
    TransportLoss,
    /// Broker-side failure
    Amqp(AmqpError),
}

impl fmt::Display for AdapterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Authentication => write!(f, "authentication failed"),
            Self::SessionCollision(q) => write!(f, "session collision on queue {}", q),
            Self::ProtocolViolation(msg) => write!(f, "protocol violation: {}", msg),
            Self::Delivery => write!(f, "delivery failed"),
            Self::TransportLoss => write!(f, "transport lost"),
            Self::Amqp(e) => write!(f, "broker error: {}", e),
        }
    }
}

impl std::error::Error for AdapterError {}

impl From<AmqpError> for AdapterError {
    fn from(e: AmqpError) -> Self {
        match e {
            AmqpError::AccessRefused => AdapterError::Authentication,
            AmqpError::PreconditionFailed(queue) => AdapterError::SessionCollision(queue),
            other => AdapterError::Amqp(other),
        }
    }
}

/// Why a connection was closed from the adapter side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LossCause {
    /// A second CONNECT arrived for the same client id
    SessionTakenOver,
    /// The delivery callback reported a failure
    DeliveryFailure,
}

impl fmt::Display for LossCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SessionTakenOver => write!(f, "session taken over"),
            Self::DeliveryFailure => write!(f, "delivery failure"),
        }
    }
}
