//! `cloudbridge tunnel`: forward a local port until Ctrl-C.

use anyhow::{Context, Result};
use cloudbridge::{Client, ClientConfig, TunnelConfig};
use tracing::info;

pub async fn tunnel_command(
    config: ClientConfig,
    peer_id: &str,
    local_port: u16,
    remote_port: u16,
) -> Result<()> {
    let client = Client::new(config).context("Failed to create client")?;
    // Fail early on a bad token or unreachable relay instead of on first use.
    client
        .ensure_connected()
        .await
        .context("Failed to connect to relay")?;

    let tunnel = client
        .create_tunnel(TunnelConfig::new(local_port, peer_id, remote_port))
        .await
        .context("Failed to create tunnel")?;
    let addr = tunnel
        .local_addr()
        .context("Tunnel has no local address")?;
    eprintln!("Forwarding {addr} -> {peer_id}:{remote_port} (Ctrl-C to stop)");

    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("Failed to listen for Ctrl-C")?,
        _ = client.serve() => {}
    }

    info!(
        tunnel = %tunnel.id(),
        sessions = tunnel.total_sessions(),
        "stopping tunnel"
    );
    client.close().await.context("Failed to close client")?;
    Ok(())
}
