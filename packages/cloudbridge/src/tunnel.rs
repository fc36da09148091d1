//! TCP port forwarding over peer connections.
//!
//! A [`Tunnel`] owns a loopback listener. Each accepted socket becomes a
//! forwarding session: connect to the remote peer, send the tunnel request,
//! then pump bytes both ways until either side goes away.
//!
//! ```text
//! local client ──► 127.0.0.1:local_port ──► PeerConnection ──► relay ──► remote peer
//!                                                                         └─► localhost:remote_port
//! ```

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connection::PeerConnection;
use crate::error::TunnelError;
use crate::handshake::ControlMessage;
use crate::registry::ConnectionRegistry;

const COPY_BUFFER_SIZE: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelProtocol {
    #[default]
    Tcp,
    Udp,
    Quic,
}

impl fmt::Display for TunnelProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TunnelProtocol::Tcp => "tcp",
            TunnelProtocol::Udp => "udp",
            TunnelProtocol::Quic => "quic",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// Loopback port to listen on. 0 picks an ephemeral port.
    pub local_port: u16,
    pub remote_peer: String,
    pub remote_port: u16,
    #[serde(default)]
    pub protocol: TunnelProtocol,
}

impl TunnelConfig {
    /// Reject configs that could never carry a session.
    pub fn validate(&self) -> Result<(), TunnelError> {
        if self.remote_peer.trim().is_empty() {
            return Err(TunnelError::InvalidConfig("remote_peer must not be empty".into()));
        }
        // A port-0 request is classified as data by the receiver.
        if self.remote_port == 0 {
            return Err(TunnelError::InvalidConfig("remote_port must be non-zero".into()));
        }
        if self.protocol != TunnelProtocol::Tcp {
            return Err(TunnelError::UnsupportedProtocol(self.protocol.to_string()));
        }
        Ok(())
    }

    pub fn new(local_port: u16, remote_peer: impl Into<String>, remote_port: u16) -> Self {
        Self {
            local_port,
            remote_peer: remote_peer.into(),
            remote_port,
            protocol: TunnelProtocol::Tcp,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Created,
    Listening,
    Stopped,
}

struct Inner {
    id: String,
    config: TunnelConfig,
    registry: ConnectionRegistry,
    state: Mutex<TunnelState>,
    local_addr: Mutex<Option<SocketAddr>>,
    cancel: CancellationToken,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    active_sessions: AtomicUsize,
    total_sessions: AtomicU64,
}

/// A local TCP listener forwarding to a remote peer. Cheap to clone.
#[derive(Clone)]
pub struct Tunnel {
    inner: Arc<Inner>,
}

impl fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tunnel")
            .field("id", &self.inner.id)
            .field("config", &self.inner.config)
            .field("state", &self.state())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Tunnel {
    pub(crate) fn new(
        config: TunnelConfig,
        registry: ConnectionRegistry,
    ) -> Result<Self, TunnelError> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(Inner {
                id: format!("tunnel-{}", uuid::Uuid::new_v4().simple()),
                config,
                registry,
                state: Mutex::new(TunnelState::Created),
                local_addr: Mutex::new(None),
                cancel: CancellationToken::new(),
                accept_task: Mutex::new(None),
                active_sessions: AtomicUsize::new(0),
                total_sessions: AtomicU64::new(0),
            }),
        })
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn config(&self) -> &TunnelConfig {
        &self.inner.config
    }

    pub fn state(&self) -> TunnelState {
        *lock(&self.inner.state)
    }

    /// Bound listener address, once listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *lock(&self.inner.local_addr)
    }

    pub fn active_sessions(&self) -> usize {
        self.inner.active_sessions.load(Ordering::Acquire)
    }

    pub fn total_sessions(&self) -> u64 {
        self.inner.total_sessions.load(Ordering::Acquire)
    }

    /// Bind the listener and start accepting local connections.
    pub async fn start(&self) -> Result<(), TunnelError> {
        if self.state() != TunnelState::Created {
            return Err(TunnelError::AlreadyStarted(self.inner.id.clone()));
        }

        let port = self.inner.config.local_port;
        let listener = TcpListener::bind(("127.0.0.1", port))
            .await
            .map_err(|source| TunnelError::Bind { port, source })?;
        let addr = listener
            .local_addr()
            .map_err(|source| TunnelError::Bind { port, source })?;

        {
            let mut state = lock(&self.inner.state);
            // stop() may have raced the bind.
            if *state != TunnelState::Created {
                return Err(TunnelError::AlreadyStarted(self.inner.id.clone()));
            }
            *state = TunnelState::Listening;
        }
        *lock(&self.inner.local_addr) = Some(addr);
        info!(
            tunnel = %self.inner.id,
            %addr,
            peer = %self.inner.config.remote_peer,
            remote_port = self.inner.config.remote_port,
            "tunnel listening"
        );

        let inner = self.inner.clone();
        let task = tokio::spawn(accept_loop(inner, listener));
        *lock(&self.inner.accept_task) = Some(task);
        Ok(())
    }

    /// Close the listener. In-flight sessions keep running until they end on
    /// their own. Idempotent.
    pub async fn stop(&self) -> Result<(), TunnelError> {
        {
            let mut state = lock(&self.inner.state);
            if *state == TunnelState::Stopped {
                return Ok(());
            }
            *state = TunnelState::Stopped;
        }
        self.inner.cancel.cancel();

        let task = lock(&self.inner.accept_task).take();
        if let Some(task) = task {
            task.await?;
        }
        info!(tunnel = %self.inner.id, "tunnel stopped");
        Ok(())
    }
}

async fn accept_loop(inner: Arc<Inner>, listener: TcpListener) {
    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((socket, from)) => {
                        debug!(tunnel = %inner.id, %from, "accepted local connection");
                        tokio::spawn(run_session(inner.clone(), socket));
                    }
                    Err(e) => {
                        warn!(tunnel = %inner.id, error = %e, "tunnel accept failed");
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                }
            }
        }
    }
    debug!(tunnel = %inner.id, "tunnel accept loop exited");
}

struct SessionGuard<'a>(&'a AtomicUsize);

impl<'a> SessionGuard<'a> {
    fn enter(active: &'a AtomicUsize) -> Self {
        active.fetch_add(1, Ordering::AcqRel);
        Self(active)
    }
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

async fn run_session(inner: Arc<Inner>, socket: TcpStream) {
    let _active = SessionGuard::enter(&inner.active_sessions);
    inner.total_sessions.fetch_add(1, Ordering::AcqRel);
    let peer = &inner.config.remote_peer;

    let conn = match inner.registry.connect(peer).await {
        Ok(conn) => conn,
        Err(e) => {
            warn!(
                tunnel = %inner.id,
                peer = %peer,
                error = %e,
                "tunnel session could not reach peer"
            );
            return;
        }
    };

    if !send_tunnel_request(&inner.id, &conn, inner.config.remote_port) {
        return;
    }

    debug!(tunnel = %inner.id, peer = %peer, "tunnel session started");
    pump(socket, conn).await;
    debug!(tunnel = %inner.id, peer = %peer, "tunnel session ended");
}

/// Send the tunnel request as the first payload on `conn`.
///
/// On failure the connection is closed, which also drops it from the
/// registry.
fn send_tunnel_request(tunnel: &str, conn: &PeerConnection, port: u16) -> bool {
    let sent = ControlMessage::Tunnel { port }
        .to_bytes()
        .map_err(|e| e.to_string())
        .and_then(|request| conn.write(&request).map_err(|e| e.to_string()));
    match sent {
        Ok(()) => true,
        Err(error) => {
            warn!(tunnel, peer = %conn.peer_id(), port, %error, "tunnel handshake failed");
            conn.close();
            false
        }
    }
}

/// Bridge an inbound tunnel request to the local service on `port`.
pub(crate) async fn bridge_inbound(conn: PeerConnection, port: u16) {
    match TcpStream::connect(("localhost", port)).await {
        Ok(socket) => {
            info!(peer = %conn.peer_id(), port, "bridging tunnel request to local service");
            pump(socket, conn).await;
        }
        Err(e) => {
            warn!(
                peer = %conn.peer_id(),
                port,
                error = %e,
                "local service unreachable for tunnel request"
            );
            conn.close();
        }
    }
}

/// Copy bytes between `socket` and `conn` until either side finishes.
///
/// Local EOF or error closes the peer connection; a closed peer connection
/// half-closes the local socket.
pub(crate) async fn pump(socket: TcpStream, conn: PeerConnection) {
    let (mut reader, mut writer) = socket.into_split();

    let upstream = async {
        let mut buf = vec![0u8; COPY_BUFFER_SIZE];
        loop {
            tokio::select! {
                _ = conn.closed() => break,
                read = reader.read(&mut buf) => match read {
                    Ok(0) => break,
                    Ok(n) => {
                        if let Err(e) = conn.write(&buf[..n]) {
                            debug!(peer = %conn.peer_id(), error = %e, "peer write failed");
                            break;
                        }
                    }
                    Err(e) => {
                        debug!(peer = %conn.peer_id(), error = %e, "local read failed");
                        break;
                    }
                },
            }
        }
        conn.close();
    };

    let downstream = async {
        while let Ok(data) = conn.read().await {
            if let Err(e) = writer.write_all(&data).await {
                debug!(peer = %conn.peer_id(), error = %e, "local write failed");
                conn.close();
                break;
            }
        }
        let _ = writer.shutdown().await;
    };

    tokio::join!(upstream, downstream);
}
