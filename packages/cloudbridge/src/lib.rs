//! CloudBridge client SDK.
//!
//! A single authenticated WebSocket to the relay carries every peer
//! connection as JSON `p2p` envelopes. On top of it the crate offers
//! peer-addressed byte streams ([`PeerConnection`]) and TCP port forwarding
//! ([`Tunnel`]).
//!
//! # Example
//!
//! ```no_run
//! use cloudbridge::{Client, ClientConfig, TunnelConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), cloudbridge::ClientError> {
//!     let client = Client::new(ClientConfig::new("my-token").region("eu-central"))?;
//!
//!     let conn = client.connect("peerB").await?;
//!     conn.write(b"ping")?;
//!     let reply = conn.read().await?;
//!     println!("{}", String::from_utf8_lossy(&reply));
//!
//!     // Forward 127.0.0.1:8080 to port 80 on peerB.
//!     let tunnel = client
//!         .create_tunnel(TunnelConfig::new(8080, "peerB", 80))
//!         .await?;
//!     println!("tunnel {} listening", tunnel.id());
//!
//!     client.close().await
//! }
//! ```

mod client;
pub mod config;
mod connection;
pub mod error;
pub mod handshake;
mod mesh;
mod registry;
mod service;
pub mod transport;
mod tunnel;

pub use client::{Client, Health};
pub use config::{ClientConfig, FileConfig, LogLevel, load_config};
pub use connection::{ConnectionMetrics, PeerConnection};
pub use error::{ClientError, ConfigError, ConnectionError, TransportError, TunnelError};
pub use mesh::{Mesh, PeerInfo, PeerStatus};
pub use registry::{ConnectionRegistry, Routed};
pub use service::ServiceInfo;
pub use transport::{LinkState, RelayTransport, TransportEvent};
pub use tunnel::{Tunnel, TunnelConfig, TunnelProtocol, TunnelState};
