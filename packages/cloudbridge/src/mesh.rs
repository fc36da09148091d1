//! Mesh network handle.
//!
//! Mesh membership is not implemented by the relay protocol; every operation
//! succeeds after logging and `peers()` is always empty.

use std::time::Duration;

use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub id: String,
    pub status: PeerStatus,
    pub latency: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct Mesh {
    network: String,
}

impl Mesh {
    pub(crate) fn new(network: impl Into<String>) -> Self {
        Self {
            network: network.into(),
        }
    }

    pub fn network_name(&self) -> &str {
        &self.network
    }

    pub async fn join(&self) {
        info!(network = %self.network, "joined mesh");
    }

    pub async fn leave(&self) {
        info!(network = %self.network, "left mesh");
    }

    pub async fn broadcast(&self, data: &[u8]) {
        info!(network = %self.network, len = data.len(), "mesh broadcast");
    }

    pub async fn send(&self, peer_id: &str, data: &[u8]) {
        info!(network = %self.network, peer = %peer_id, len = data.len(), "mesh send");
    }

    pub async fn peers(&self) -> Vec<PeerInfo> {
        Vec::new()
    }
}
