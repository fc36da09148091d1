//! Peer-addressed byte streams multiplexed over the relay transport.
//!
//! A [`PeerConnection`] is a handle: clones share the same inbox and
//! liveness flag. Inbound payloads are queued in a bounded FIFO and handed
//! out one per [`PeerConnection::read`] call in the order the relay
//! delivered them. Closing is local and one-shot: the first `close()` flips
//! the connection to closed, wakes every `closed()` waiter and runs the
//! registered close hooks; later calls do nothing.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{ConnectionError, TransportError};
use crate::transport::{RelayTransport, WeakTransport};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

type CloseHook = Box<dyn FnOnce() + Send>;

struct Shared {
    id: u64,
    peer_id: String,
    transport: WeakTransport,
    open: AtomicBool,
    closed: CancellationToken,
    capacity: usize,
    inbox_tx: mpsc::Sender<Vec<u8>>,
    inbox_rx: tokio::sync::Mutex<mpsc::Receiver<Vec<u8>>>,
    close_hooks: Mutex<Vec<CloseHook>>,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    connected_at: Instant,
}

/// Point-in-time traffic counters for one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionMetrics {
    /// Payload bytes handed to the relay.
    pub bytes_sent: u64,
    /// Payload bytes accepted into the inbox.
    pub bytes_received: u64,
    pub connected_at: Instant,
}

/// A logical connection to one peer over the shared relay link.
#[derive(Clone)]
pub struct PeerConnection {
    inner: Arc<Shared>,
}

impl std::fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnection")
            .field("peer_id", &self.inner.peer_id)
            .field("open", &self.is_open())
            .finish()
    }
}

impl PeerConnection {
    pub(crate) fn new(peer_id: &str, transport: &RelayTransport, capacity: usize) -> Self {
        let (inbox_tx, inbox_rx) = mpsc::channel(capacity.max(1));
        Self {
            inner: Arc::new(Shared {
                id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
                peer_id: peer_id.to_string(),
                transport: transport.downgrade(),
                open: AtomicBool::new(true),
                closed: CancellationToken::new(),
                capacity,
                inbox_tx,
                inbox_rx: tokio::sync::Mutex::new(inbox_rx),
                close_hooks: Mutex::new(Vec::new()),
                bytes_sent: AtomicU64::new(0),
                bytes_received: AtomicU64::new(0),
                connected_at: Instant::now(),
            }),
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.inner.peer_id
    }

    /// Process-unique identity of this connection (clones share it).
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::Acquire)
    }

    /// Send `data` to the peer. Does not wait for the bytes to reach the wire.
    pub fn write(&self, data: &[u8]) -> Result<(), ConnectionError> {
        if !self.is_open() {
            return Err(ConnectionError::Closed);
        }
        let transport = self
            .inner
            .transport
            .upgrade()
            .ok_or(TransportError::NotConnected)?;
        transport.send(&self.inner.peer_id, data)?;
        self.inner
            .bytes_sent
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    pub fn metrics(&self) -> ConnectionMetrics {
        ConnectionMetrics {
            bytes_sent: self.inner.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.inner.bytes_received.load(Ordering::Relaxed),
            connected_at: self.inner.connected_at,
        }
    }

    /// Wait for the next inbound payload.
    ///
    /// Returns [`ConnectionError::Closed`] once the connection is closed,
    /// discarding anything still queued.
    pub async fn read(&self) -> Result<Vec<u8>, ConnectionError> {
        if !self.is_open() {
            return Err(ConnectionError::Closed);
        }
        let mut inbox = self.inner.inbox_rx.lock().await;
        tokio::select! {
            biased;
            _ = self.inner.closed.cancelled() => Err(ConnectionError::Closed),
            data = inbox.recv() => data.ok_or(ConnectionError::Closed),
        }
    }

    /// Resolves once the connection has been closed.
    pub async fn closed(&self) {
        self.inner.closed.cancelled().await;
    }

    /// Close the connection. Only the first call has any effect; the shared
    /// transport is left untouched.
    pub fn close(&self) {
        if self
            .inner
            .open
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        debug!(peer = %self.inner.peer_id, "peer connection closed");
        self.inner.closed.cancel();

        let hooks = std::mem::take(
            &mut *self
                .inner
                .close_hooks
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for hook in hooks {
            hook();
        }
    }

    /// Run `hook` exactly once when the connection closes. Runs immediately
    /// if it is already closed.
    pub fn on_close(&self, hook: impl FnOnce() + Send + 'static) {
        let mut hooks = self
            .inner
            .close_hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // Checked under the hook lock so a concurrent close cannot miss it.
        if self.is_open() {
            hooks.push(Box::new(hook));
            return;
        }
        drop(hooks);
        hook();
    }

    /// Queue an inbound payload. Returns false if it was not accepted.
    ///
    /// A full inbox closes the connection rather than silently dropping bytes
    /// from the middle of a stream.
    pub(crate) fn deliver(&self, data: Vec<u8>) -> bool {
        if !self.is_open() {
            return false;
        }
        let len = data.len() as u64;
        match self.inner.inbox_tx.try_send(data) {
            Ok(()) => {
                self.inner.bytes_received.fetch_add(len, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Full(_)) => {
                warn!(
                    peer = %self.inner.peer_id,
                    capacity = self.inner.capacity,
                    "peer inbox overflowed, closing connection"
                );
                self.close();
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}
