/// Datagram wire format
///
/// Outbound: `{"type":"wake","label":..,"score":..,"ts":..}`
/// Inbound:  `{"type":"session_done"}` (extra fields ignored)

use crate::detector::WakeEvent;
use serde::{Deserialize, Serialize};

/// Largest datagram read from the ack socket
pub const MAX_DATAGRAM: usize = 2048;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    Wake {
        label: String,
        score: f32,
        /// Unix epoch seconds
        ts: f64,
    },
    SessionDone {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ts: Option<f64>,
    },
}

impl Message {
    pub fn wake(event: &WakeEvent) -> Self {
        Self::Wake {
            label: event.label.clone(),
            score: event.score,
            ts: event.unix_secs(),
        }
    }

    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(payload: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(payload)
    }

    /// True only for a well-formed `session_done` message
    pub fn is_session_done(payload: &[u8]) -> bool {
        matches!(Self::from_bytes(payload), Ok(Self::SessionDone { .. }))
    }
}
