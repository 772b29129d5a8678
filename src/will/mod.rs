//! Will message lifecycle
//!
//! A will is armed at CONNECT and fires at most once, on ungraceful
//! disconnect. A graceful DISCONNECT disarms it; taking it for firing also
//! disarms it, so takeover followed by transport loss cannot fire twice.

use parking_lot::Mutex;
use tracing::debug;

use crate::protocol::WillMessage;

/// Per-connection will slot
#[derive(Debug, Default)]
pub struct WillSlot {
    armed: Mutex<Option<WillMessage>>,
}

impl WillSlot {
    pub fn new() -> Self {
        Self {
            armed: Mutex::new(None),
        }
    }

    /// Arm the slot with the CONNECT's will, replacing any previous one
    pub fn arm(&self, will: Option<WillMessage>) {
        *self.armed.lock() = will;
    }

    /// Disarm without firing (graceful DISCONNECT)
    pub fn disarm(&self) {
        if self.armed.lock().take().is_some() {
            debug!("will disarmed");
        }
    }

    /// Take the will for firing; subsequent calls return None
    pub fn take(&self) -> Option<WillMessage> {
        self.armed.lock().take()
    }

    pub fn is_armed(&self) -> bool {
        self.armed.lock().is_some()
    }
}
