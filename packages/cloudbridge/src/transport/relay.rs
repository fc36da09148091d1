//! The single multiplexed control connection to the relay.
//!
//! One WebSocket carries envelopes for every peer. Once open, the socket is
//! split between a writer task, which drains an unbounded channel so that
//! [`RelayTransport::send`] never awaits, and a reader task, which decodes
//! frames and forwards [`PeerMessage`]s to a single consumer in arrival order.
//!
//! Any close that was not requested through [`RelayTransport::close`]
//! schedules one reconnect attempt after `reconnect_delay`. A failed attempt
//! goes back through the same path, so retries continue indefinitely at a
//! fixed interval.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderValue, header::AUTHORIZATION};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::envelope::{self, PeerMessage};
use super::tls;
use crate::error::TransportError;

type RelayStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Static settings for the relay connection.
#[derive(Clone, Debug)]
pub struct TransportConfig {
    pub url: String,
    pub token: String,
    pub insecure_skip_verify: bool,
    pub connect_timeout: Duration,
    pub reconnect_delay: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

/// Lifecycle notifications published by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportEvent {
    Open,
    Close,
}

enum Link {
    Disconnected,
    Connecting,
    Connected {
        generation: u64,
        outbound: mpsc::UnboundedSender<Message>,
        cancel: CancellationToken,
    },
}

impl Link {
    fn state(&self) -> LinkState {
        match self {
            Link::Disconnected => LinkState::Disconnected,
            Link::Connecting => LinkState::Connecting,
            Link::Connected { .. } => LinkState::Connected,
        }
    }
}

struct Inner {
    config: TransportConfig,
    link: Mutex<Link>,
    /// Serializes handshakes so at most one connection is ever being opened.
    connecting: tokio::sync::Mutex<()>,
    reconnect: Mutex<Option<JoinHandle<()>>>,
    /// Set by `close()`, cleared by an explicit `connect()`.
    shut_down: AtomicBool,
    /// Cancelled by `close()`; awaited by `closed()`.
    shutdown: Mutex<CancellationToken>,
    generation: AtomicU64,
    events: broadcast::Sender<TransportEvent>,
    inbound: mpsc::UnboundedSender<PeerMessage>,
}

/// Handle to the relay connection. Cheap to clone.
#[derive(Clone)]
pub struct RelayTransport {
    inner: Arc<Inner>,
}

/// Non-owning reference to a [`RelayTransport`], held by peer connections.
#[derive(Clone)]
pub struct WeakTransport {
    inner: Weak<Inner>,
}

impl WeakTransport {
    pub fn upgrade(&self) -> Option<RelayTransport> {
        self.inner.upgrade().map(|inner| RelayTransport { inner })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl RelayTransport {
    /// Create a disconnected transport. Inbound peer messages are delivered,
    /// in wire order, on the returned receiver.
    pub fn new(config: TransportConfig) -> (Self, mpsc::UnboundedReceiver<PeerMessage>) {
        let (inbound, rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(16);
        let inner = Inner {
            config,
            link: Mutex::new(Link::Disconnected),
            connecting: tokio::sync::Mutex::new(()),
            reconnect: Mutex::new(None),
            shut_down: AtomicBool::new(false),
            shutdown: Mutex::new(CancellationToken::new()),
            generation: AtomicU64::new(0),
            events,
            inbound,
        };
        (
            Self {
                inner: Arc::new(inner),
            },
            rx,
        )
    }

    pub fn downgrade(&self) -> WeakTransport {
        WeakTransport {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn url(&self) -> &str {
        &self.inner.config.url
    }

    pub fn state(&self) -> LinkState {
        lock(&self.inner.link).state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == LinkState::Connected
    }

    /// Subscribe to `Open` / `Close` notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.inner.events.subscribe()
    }

    /// Open the relay connection. Returns immediately if already connected.
    ///
    /// An explicit call re-enables reconnection after a previous `close()`.
    pub async fn connect(&self) -> Result<(), TransportError> {
        if self.is_connected() {
            return Ok(());
        }
        if self.inner.shut_down.swap(false, Ordering::SeqCst) {
            let mut shutdown = lock(&self.inner.shutdown);
            if shutdown.is_cancelled() {
                *shutdown = CancellationToken::new();
            }
        }
        self.inner.establish().await
    }

    /// Queue `payload` for `peer_id`. Never blocks; fails fast when there is
    /// no live relay connection.
    pub fn send(&self, peer_id: &str, payload: &[u8]) -> Result<(), TransportError> {
        let outbound = match &*lock(&self.inner.link) {
            Link::Connected { outbound, .. } => outbound.clone(),
            _ => return Err(TransportError::NotConnected),
        };
        let frame = envelope::encode(peer_id, payload)?;
        outbound
            .send(Message::Text(frame.into()))
            .map_err(|_| TransportError::NotConnected)
    }

    /// Tear down the connection and cancel any pending reconnect. Idempotent.
    pub fn close(&self) {
        let inner = &self.inner;
        inner.shut_down.store(true, Ordering::SeqCst);

        if let Some(timer) = lock(&inner.reconnect).take() {
            timer.abort();
            debug!("cancelled pending relay reconnect");
        }

        let previous = std::mem::replace(&mut *lock(&inner.link), Link::Disconnected);
        if let Link::Connected { cancel, .. } = previous {
            cancel.cancel();
            info!("relay transport closed");
            let _ = inner.events.send(TransportEvent::Close);
        }

        lock(&inner.shutdown).cancel();
    }

    /// Resolves once `close()` has been called.
    pub async fn closed(&self) {
        let token = lock(&self.inner.shutdown).clone();
        token.cancelled().await;
    }

    /// Whether `close()` has been called since the last explicit `connect()`.
    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::SeqCst)
    }

    /// Whether a reconnect timer is outstanding.
    pub fn reconnect_pending(&self) -> bool {
        lock(&self.inner.reconnect).is_some()
    }
}

impl Inner {
    async fn establish(self: &Arc<Self>) -> Result<(), TransportError> {
        let _guard = self.connecting.lock().await;
        if lock(&self.link).state() == LinkState::Connected {
            return Ok(());
        }
        *lock(&self.link) = Link::Connecting;

        info!(url = %self.config.url, "connecting to relay");
        match self.handshake().await {
            Ok(stream) => {
                if !self.attach(stream) {
                    debug!("transport closed during handshake, dropping connection");
                    return Err(TransportError::Closed);
                }
                info!(url = %self.config.url, "relay connected");
                let _ = self.events.send(TransportEvent::Open);
                Ok(())
            }
            Err(_) if self.shut_down.load(Ordering::SeqCst) => {
                *lock(&self.link) = Link::Disconnected;
                Err(TransportError::Closed)
            }
            Err(e) => {
                *lock(&self.link) = Link::Disconnected;
                warn!(url = %self.config.url, error = %e, "relay connection failed");
                self.schedule_reconnect();
                Err(e)
            }
        }
    }

    async fn handshake(&self) -> Result<RelayStream, TransportError> {
        let url = &self.config.url;
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::InvalidUrl {
                url: url.clone(),
                reason: e.to_string(),
            })?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", self.config.token))
            .map_err(|_| TransportError::InvalidToken)?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let connector = tls::connector(url, self.config.insecure_skip_verify)?;
        let connecting =
            tokio_tungstenite::connect_async_tls_with_config(request, None, false, connector);

        let (stream, _response) = tokio::time::timeout(self.config.connect_timeout, connecting)
            .await
            .map_err(|_| TransportError::HandshakeTimeout(self.config.connect_timeout))?
            .map_err(|e| TransportError::HandshakeFailed(Box::new(e)))?;
        Ok(stream)
    }

    /// Install a freshly opened stream as the live link and start its tasks.
    /// Returns false, dropping the stream, if `close()` won the race.
    fn attach(self: &Arc<Self>, stream: RelayStream) -> bool {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (outbound, mut rx) = mpsc::unbounded_channel::<Message>();
        let cancel = CancellationToken::new();

        // The link must be visible before the reader can observe a close.
        {
            let mut link = lock(&self.link);
            if self.shut_down.load(Ordering::SeqCst) {
                *link = Link::Disconnected;
                return false;
            }
            *link = Link::Connected {
                generation,
                outbound,
                cancel: cancel.clone(),
            };
        }
        let (mut sink, mut frames) = stream.split();

        // Writer task: drain channel → relay socket
        let writer_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = writer_cancel.cancelled() => {
                        let _ = sink.close().await;
                        break;
                    }
                    msg = rx.recv() => {
                        match msg {
                            Some(msg) => {
                                if let Err(e) = sink.send(msg).await {
                                    warn!(error = %e, "relay write failed");
                                    break;
                                }
                            }
                            None => break,
                        }
                    }
                }
            }
            writer_cancel.cancel();
        });

        // Reader task: relay socket → inbound channel
        let reader_cancel = cancel;
        let inbound = self.inbound.clone();
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = reader_cancel.cancelled() => break,
                    frame = frames.next() => {
                        match frame {
                            Some(Ok(Message::Text(text))) => {
                                route_frame(envelope::decode(text.as_str()), &inbound);
                            }
                            Some(Ok(Message::Binary(data))) => {
                                route_frame(envelope::decode_binary(&data), &inbound);
                            }
                            Some(Ok(Message::Close(frame))) => {
                                debug!(?frame, "relay sent close");
                                break;
                            }
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                warn!(error = %e, "relay read failed");
                                break;
                            }
                            None => break,
                        }
                    }
                }
            }
            reader_cancel.cancel();
            if let Some(inner) = weak.upgrade() {
                inner.on_link_lost(generation);
            }
        });
        true
    }

    /// Called by a reader task when its stream ends.
    fn on_link_lost(self: &Arc<Self>, generation: u64) {
        {
            let mut link = lock(&self.link);
            match &*link {
                Link::Connected { generation: g, .. } if *g == generation => {
                    *link = Link::Disconnected;
                }
                // Already replaced or closed explicitly.
                _ => return,
            }
        }
        warn!(url = %self.config.url, "relay connection lost");
        let _ = self.events.send(TransportEvent::Close);
        self.schedule_reconnect();
    }

    /// Arm the reconnect timer unless one is pending or the transport was closed.
    /// Returns whether a new timer was scheduled.
    fn schedule_reconnect(self: &Arc<Self>) -> bool {
        if self.shut_down.load(Ordering::SeqCst) {
            return false;
        }
        let mut slot = lock(&self.reconnect);
        if slot.is_some() {
            debug!("relay reconnect already scheduled");
            return false;
        }

        let delay = self.config.reconnect_delay;
        info!(?delay, "scheduling relay reconnect");
        let weak = Arc::downgrade(self);
        *slot = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            lock(&inner.reconnect).take();
            if inner.shut_down.load(Ordering::SeqCst) {
                return;
            }
            info!(url = %inner.config.url, "attempting relay reconnect");
            // A failure re-arms the timer from inside `establish`.
            if let Err(e) = inner.establish().await {
                debug!(error = %e, "relay reconnect attempt failed");
            }
        }));
        true
    }
}

fn route_frame(
    decoded: Result<Option<PeerMessage>, crate::error::FrameError>,
    inbound: &mpsc::UnboundedSender<PeerMessage>,
) {
    match decoded {
        Ok(Some(msg)) => {
            trace!(peer = %msg.peer_id, len = msg.payload.len(), "relay frame");
            let _ = inbound.send(msg);
        }
        Ok(None) => debug!("ignoring relay frame of unknown type"),
        Err(e) => warn!(error = %e, "dropping malformed relay frame"),
    }
}
