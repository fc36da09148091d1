//! Peer id → connection table.
//!
//! At most one open [`PeerConnection`] exists per peer id. Outbound
//! `connect()` and inbound routing both go through [`ConnectionRegistry::get_or_create`],
//! so a race between the two resolves to the same connection.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tracing::{debug, trace};

use crate::connection::PeerConnection;
use crate::error::ConnectionError;
use crate::transport::{PeerMessage, RelayTransport};

struct Inner {
    transport: RelayTransport,
    connections: Mutex<HashMap<String, PeerConnection>>,
    inbox_capacity: usize,
}

/// Outcome of routing one inbound message.
#[derive(Debug)]
pub enum Routed {
    /// Appended to an existing connection's inbox.
    Delivered,
    /// The target connection closed or overflowed; the payload was dropped.
    Dropped,
    /// First message from this peer. The payload has not been delivered so
    /// the caller can inspect it before deciding where it goes.
    Opened {
        connection: PeerConnection,
        first_payload: Vec<u8>,
    },
}

#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<Inner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ConnectionRegistry {
    pub fn new(transport: RelayTransport, inbox_capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                connections: Mutex::new(HashMap::new()),
                inbox_capacity,
            }),
        }
    }

    pub fn transport(&self) -> &RelayTransport {
        &self.inner.transport
    }

    /// Ensure the relay link is up and return the connection for `peer_id`,
    /// creating it if needed.
    pub async fn connect(&self, peer_id: &str) -> Result<PeerConnection, ConnectionError> {
        self.inner.transport.connect().await?;
        Ok(self.get_or_create(peer_id).0)
    }

    /// Look up the open connection for `peer_id` or register a new one.
    /// The flag is true when the connection was created by this call.
    pub fn get_or_create(&self, peer_id: &str) -> (PeerConnection, bool) {
        let mut connections = lock(&self.inner.connections);
        if let Some(existing) = connections.get(peer_id) {
            if existing.is_open() {
                return (existing.clone(), false);
            }
        }

        let connection = PeerConnection::new(
            peer_id,
            &self.inner.transport,
            self.inner.inbox_capacity,
        );
        connections.insert(peer_id.to_string(), connection.clone());
        drop(connections);
        debug!(peer = %peer_id, "registered peer connection");

        let registry = Arc::downgrade(&self.inner);
        let peer = peer_id.to_string();
        let id = connection.id();
        connection.on_close(move || remove_if_current(&registry, &peer, id));
        (connection, true)
    }

    /// Route an inbound message to its connection, creating one if this is
    /// the first message from the peer.
    pub fn route(&self, message: PeerMessage) -> Routed {
        let PeerMessage { peer_id, payload } = message;
        let (connection, created) = self.get_or_create(&peer_id);
        if created {
            return Routed::Opened {
                connection,
                first_payload: payload,
            };
        }
        if connection.deliver(payload) {
            trace!(peer = %peer_id, "delivered to existing connection");
            Routed::Delivered
        } else {
            Routed::Dropped
        }
    }

    pub fn get(&self, peer_id: &str) -> Option<PeerConnection> {
        lock(&self.inner.connections)
            .get(peer_id)
            .filter(|c| c.is_open())
            .cloned()
    }

    /// Peer ids with an open connection.
    pub fn peers(&self) -> Vec<String> {
        let mut peers: Vec<String> = lock(&self.inner.connections)
            .iter()
            .filter(|(_, c)| c.is_open())
            .map(|(peer, _)| peer.clone())
            .collect();
        peers.sort();
        peers
    }

    pub fn len(&self) -> usize {
        lock(&self.inner.connections)
            .values()
            .filter(|c| c.is_open())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close every registered connection.
    pub fn close_all(&self) {
        let connections: Vec<PeerConnection> =
            lock(&self.inner.connections).values().cloned().collect();
        for connection in connections {
            connection.close();
        }
    }

    pub(crate) fn downgrade(&self) -> WeakRegistry {
        WeakRegistry {
            inner: Arc::downgrade(&self.inner),
        }
    }
}

#[derive(Clone)]
pub(crate) struct WeakRegistry {
    inner: Weak<Inner>,
}

impl WeakRegistry {
    pub(crate) fn upgrade(&self) -> Option<ConnectionRegistry> {
        self.inner.upgrade().map(|inner| ConnectionRegistry { inner })
    }
}

fn remove_if_current(registry: &Weak<Inner>, peer_id: &str, id: u64) {
    let Some(inner) = registry.upgrade() else {
        return;
    };
    let mut connections = lock(&inner.connections);
    // A replacement may already sit under the same peer id.
    if connections.get(peer_id).is_some_and(|c| c.id() == id) {
        connections.remove(peer_id);
        debug!(peer = %peer_id, "removed peer connection");
    }
}
