//! Tunnel control message and first-payload classification.
//!
//! The only control message in the peer protocol is the tunnel request
//! `{"type":"tunnel","port":N}`, sent as the first payload of an outbound
//! tunnel connection. The receiving side inspects the first payload of every
//! implicitly created connection; anything that is not a well-formed tunnel
//! request is ordinary application data.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlMessage {
    Tunnel { port: u16 },
}

impl ControlMessage {
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// What the first inbound payload of a new connection turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirstPayload {
    /// Bridge the connection to `localhost:port`.
    Tunnel { port: u16 },
    /// Deliver the payload as the connection's first data chunk.
    Data,
}

pub fn classify(payload: &[u8]) -> FirstPayload {
    match serde_json::from_slice::<ControlMessage>(payload) {
        // Port 0 cannot name a local service.
        Ok(ControlMessage::Tunnel { port }) if port != 0 => FirstPayload::Tunnel { port },
        _ => FirstPayload::Data,
    }
}
