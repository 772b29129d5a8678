//! MQTT protocol value types
//!
//! The core types the engine shares with the wire layer. The adapter speaks
//! MQTT v3.1, so QoS 2 does not exist here.

use bytes::Bytes;

/// Quality of Service levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum QoS {
    /// At most once delivery
    #[default]
    AtMostOnce = 0,
    /// At least once delivery
    AtLeastOnce = 1,
}

impl QoS {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(QoS::AtMostOnce),
            1 => Some(QoS::AtLeastOnce),
            _ => None,
        }
    }

    /// Returns the minimum of two QoS levels (subscription downgrade rule)
    pub fn min(self, other: Self) -> Self {
        if (self as u8) < (other as u8) {
            self
        } else {
            other
        }
    }
}

/// Will message configured at CONNECT
#[derive(Debug, Clone)]
pub struct WillMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

/// A message ready for wire transmission to the client
///
/// `delivery_id` is set only when the effective QoS is 1; the wire layer
/// passes it back through `Adapter::on_puback` once the client acknowledges.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub topic: String,
    pub qos: QoS,
    pub payload: Bytes,
    pub delivery_id: Option<u64>,
}
