//! Top-level client: one relay transport, its peer connections and tunnels.
//!
//! Inbound relay messages are consumed by a single dispatcher task, started on
//! first use, which routes each message through the [`ConnectionRegistry`].
//! The first payload from a previously unknown peer is classified: tunnel
//! requests are bridged to the local service, anything else becomes the first
//! chunk of a connection handed out by [`Client::accept`].

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::connection::PeerConnection;
use crate::error::{ClientError, TunnelError};
use crate::handshake::{self, FirstPayload};
use crate::mesh::Mesh;
use crate::registry::{ConnectionRegistry, Routed, WeakRegistry};
use crate::service::ServiceInfo;
use crate::transport::{LinkState, PeerMessage, RelayTransport};
use crate::tunnel::{self, Tunnel, TunnelConfig};

/// Inbound connections waiting for `accept()`.
const ACCEPT_BACKLOG: usize = 64;

/// Snapshot returned by [`Client::health`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Health {
    pub link: LinkState,
    pub connected_peers: usize,
    pub tunnels: usize,
}

pub struct Client {
    config: ClientConfig,
    registry: ConnectionRegistry,
    inbound: Mutex<Option<mpsc::UnboundedReceiver<PeerMessage>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    accepted_tx: mpsc::Sender<PeerConnection>,
    accepted_rx: tokio::sync::Mutex<mpsc::Receiver<PeerConnection>>,
    tunnels: Mutex<HashMap<String, Tunnel>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Client {
    /// Validate `config` and build a disconnected client.
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        config.validate()?;
        let (transport, inbound) = RelayTransport::new(config.transport_config());
        let registry = ConnectionRegistry::new(transport, config.inbox_capacity);
        let (accepted_tx, accepted_rx) = mpsc::channel(ACCEPT_BACKLOG);
        debug!(url = %config.endpoint(), region = %config.region, "client created");
        Ok(Self {
            config,
            registry,
            inbound: Mutex::new(Some(inbound)),
            dispatcher: Mutex::new(None),
            accepted_tx,
            accepted_rx: tokio::sync::Mutex::new(accepted_rx),
            tunnels: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn transport(&self) -> &RelayTransport {
        self.registry.transport()
    }

    /// Open the relay connection if it is not already open.
    pub async fn ensure_connected(&self) -> Result<(), ClientError> {
        self.start_dispatcher();
        self.registry.transport().connect().await?;
        Ok(())
    }

    /// Return the connection to `peer_id`, opening the relay link first if
    /// needed. Does not wait for the peer to acknowledge anything.
    pub async fn connect(&self, peer_id: &str) -> Result<PeerConnection, ClientError> {
        self.start_dispatcher();
        let connection = self.registry.connect(peer_id).await?;
        info!(peer = %peer_id, "connected to peer");
        Ok(connection)
    }

    /// Wait for the next peer that reached this client with ordinary data.
    ///
    /// Returns `None` once the client has been closed.
    pub async fn accept(&self) -> Option<PeerConnection> {
        self.start_dispatcher();
        let mut accepted = self.accepted_rx.lock().await;
        tokio::select! {
            connection = accepted.recv() => connection,
            _ = self.registry.transport().closed() => None,
        }
    }

    /// The open connection to `peer_id`, if any.
    pub fn connection(&self, peer_id: &str) -> Option<PeerConnection> {
        self.registry.get(peer_id)
    }

    /// Peer ids with an open connection.
    pub fn connections(&self) -> Vec<String> {
        self.registry.peers()
    }

    pub fn health(&self) -> Health {
        Health {
            link: self.registry.transport().state(),
            connected_peers: self.registry.len(),
            tunnels: lock(&self.tunnels).len(),
        }
    }

    /// Start forwarding a local port to `config.remote_peer`.
    pub async fn create_tunnel(&self, config: TunnelConfig) -> Result<Tunnel, ClientError> {
        self.start_dispatcher();
        let tunnel = Tunnel::new(config, self.registry.clone())?;
        tunnel.start().await?;
        lock(&self.tunnels).insert(tunnel.id().to_string(), tunnel.clone());
        Ok(tunnel)
    }

    pub fn tunnels(&self) -> Vec<Tunnel> {
        lock(&self.tunnels).values().cloned().collect()
    }

    pub async fn stop_tunnel(&self, id: &str) -> Result<(), ClientError> {
        let tunnel = lock(&self.tunnels)
            .remove(id)
            .ok_or_else(|| TunnelError::NotFound(id.to_string()))?;
        tunnel.stop().await?;
        Ok(())
    }

    /// Close the relay link, every peer connection and every tunnel.
    ///
    /// Tunnels stop listening but their in-flight sessions are not cut; they
    /// end when their peer connection closes. Returns the first tunnel stop
    /// error, after attempting all of them.
    pub async fn close(&self) -> Result<(), ClientError> {
        self.registry.transport().close();
        self.registry.close_all();

        let tunnels: Vec<Tunnel> = lock(&self.tunnels).drain().map(|(_, t)| t).collect();
        let mut first_error = None;
        for tunnel in tunnels {
            if let Err(e) = tunnel.stop().await {
                warn!(tunnel = %tunnel.id(), error = %e, "failed to stop tunnel");
                first_error.get_or_insert(e);
            }
        }
        info!("client closed");
        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    /// Resolves once the client is closed.
    pub async fn serve(&self) {
        self.start_dispatcher();
        self.registry.transport().closed().await;
    }

    /// Not backed by the relay yet; validates and logs.
    pub async fn register_service(&self, service: &ServiceInfo) -> Result<(), ClientError> {
        service.validate()?;
        info!(service = %service.name, port = service.port, "registering service");
        Ok(())
    }

    /// Not backed by the relay yet; always empty.
    pub async fn discover_services(&self, name: &str) -> Vec<ServiceInfo> {
        info!(service = %name, "discovering services");
        Vec::new()
    }

    pub async fn join_mesh(&self, network: &str) -> Mesh {
        info!(network = %network, "joining mesh network");
        Mesh::new(network)
    }

    fn start_dispatcher(&self) {
        let Some(inbound) = lock(&self.inbound).take() else {
            return;
        };
        let task = tokio::spawn(dispatch(
            self.registry.downgrade(),
            inbound,
            self.accepted_tx.clone(),
        ));
        *lock(&self.dispatcher) = Some(task);
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.dispatcher).take() {
            task.abort();
        }
    }
}

async fn dispatch(
    registry: WeakRegistry,
    mut inbound: mpsc::UnboundedReceiver<PeerMessage>,
    accepted: mpsc::Sender<PeerConnection>,
) {
    while let Some(message) = inbound.recv().await {
        let Some(registry) = registry.upgrade() else {
            break;
        };
        // Frames queued before close() must not reopen connections.
        if registry.transport().is_shut_down() {
            debug!(peer = %message.peer_id, "client closed, dropping inbound frame");
            continue;
        }
        let (connection, first_payload) = match registry.route(message) {
            Routed::Opened {
                connection,
                first_payload,
            } => (connection, first_payload),
            Routed::Delivered | Routed::Dropped => continue,
        };

        match handshake::classify(&first_payload) {
            FirstPayload::Tunnel { port } => {
                debug!(peer = %connection.peer_id(), port, "inbound tunnel request");
                tokio::spawn(tunnel::bridge_inbound(connection, port));
            }
            FirstPayload::Data => {
                connection.deliver(first_payload);
                if accepted.try_send(connection).is_err() {
                    // Still reachable through `Client::connection`.
                    debug!("accept backlog full, not queueing inbound connection");
                }
            }
        }
    }
    debug!("dispatcher exited");
}
