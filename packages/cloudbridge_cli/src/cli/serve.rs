//! `cloudbridge serve`: accept inbound peers until Ctrl-C.
//!
//! Tunnel requests are bridged to local services by the client itself; this
//! command only prints ordinary data from peers.

use anyhow::{Context, Result};
use cloudbridge::{Client, ClientConfig};
use tracing::info;

pub async fn serve_command(config: ClientConfig) -> Result<()> {
    let client = Client::new(config).context("Failed to create client")?;
    client
        .ensure_connected()
        .await
        .context("Failed to connect to relay")?;
    eprintln!("Connected to {}, waiting for peers (Ctrl-C to stop)", client.transport().url());

    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for Ctrl-C")?;
                break;
            }
            accepted = client.accept() => {
                let Some(conn) = accepted else {
                    break;
                };
                info!(peer = %conn.peer_id(), "accepted peer");
                tokio::spawn(super::print_inbound(conn));
            }
        }
    }

    client.close().await.context("Failed to close client")?;
    Ok(())
}
