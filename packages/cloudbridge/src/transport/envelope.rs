//! JSON envelope carried in relay text frames.
//!
//! Wire format: `{ "type": "p2p", "peer_id": "<string>", "payload": "<base64>" }`
//!
//! Any other `type` is ignored by the receiver so the relay can introduce
//! new control frames without breaking older clients.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};

use crate::error::FrameError;

/// Wire envelope as it appears on the relay connection.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
enum Envelope {
    #[serde(rename = "p2p")]
    P2p { peer_id: String, payload: String },
    #[serde(other)]
    Unknown,
}

/// A decoded message addressed to or from one peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerMessage {
    pub peer_id: String,
    pub payload: Vec<u8>,
}

/// Encode a payload for `peer_id` into the text frame sent to the relay.
pub fn encode(peer_id: &str, payload: &[u8]) -> Result<String, FrameError> {
    let envelope = Envelope::P2p {
        peer_id: peer_id.to_string(),
        payload: STANDARD.encode(payload),
    };
    Ok(serde_json::to_string(&envelope)?)
}

/// Decode a relay text frame.
///
/// Returns `Ok(None)` for well-formed frames of a type this client does not
/// handle.
pub fn decode(text: &str) -> Result<Option<PeerMessage>, FrameError> {
    match serde_json::from_str::<Envelope>(text)? {
        Envelope::P2p { peer_id, payload } => Ok(Some(PeerMessage {
            peer_id,
            payload: STANDARD.decode(payload.as_bytes())?,
        })),
        Envelope::Unknown => Ok(None),
    }
}

/// Decode a binary relay frame, which carries the same JSON as a text frame.
pub fn decode_binary(data: &[u8]) -> Result<Option<PeerMessage>, FrameError> {
    decode(std::str::from_utf8(data)?)
}
