//! Relay transport layer.
//!
//! Submodules:
//! - `relay`: the WebSocket control connection, demux and reconnection
//! - `envelope`: JSON `p2p` envelope with base64 payloads
//! - `tls`: rustls connector selection for `wss://` relays

pub mod envelope;
pub mod relay;
mod tls;

pub use envelope::PeerMessage;
pub use relay::{LinkState, RelayTransport, TransportConfig, TransportEvent, WeakTransport};
