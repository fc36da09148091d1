//! `cloudbridge connect`: send to a peer and print what comes back.

use std::time::Duration;

use anyhow::{Context, Result};
use cloudbridge::{Client, ClientConfig, PeerConnection};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::debug;

const REPLY_WAIT: Duration = Duration::from_secs(10);

pub async fn connect_command(
    config: ClientConfig,
    peer_id: &str,
    message: Option<String>,
) -> Result<()> {
    let client = Client::new(config).context("Failed to create client")?;
    let conn = client
        .connect(peer_id)
        .await
        .with_context(|| format!("Failed to connect to peer {peer_id}"))?;
    eprintln!("Connected to peer {peer_id}");

    let result = match message {
        Some(message) => send_single(&conn, &message).await,
        None => interactive(&conn).await,
    };

    conn.close();
    client.close().await.context("Failed to close client")?;
    result
}

async fn send_single(conn: &PeerConnection, message: &str) -> Result<()> {
    let line = format!("{message}\n");
    conn.write(line.as_bytes()).context("Failed to send message")?;
    eprintln!("Sent {} bytes, waiting for response...", line.len());

    match tokio::time::timeout(REPLY_WAIT, conn.read()).await {
        Ok(Ok(reply)) => println!("{}", String::from_utf8_lossy(&reply).trim_end()),
        Ok(Err(e)) => debug!(error = %e, "connection ended before a reply"),
        Err(_) => eprintln!("No response received (timeout)"),
    }
    Ok(())
}

async fn interactive(conn: &PeerConnection) -> Result<()> {
    eprintln!("Type messages to send (/quit or Ctrl-C to exit)");
    let printer = tokio::spawn(super::print_inbound(conn.clone()));
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = conn.closed() => break,
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    break;
                };
                match line.trim() {
                    "" => continue,
                    "/quit" | "/exit" => break,
                    _ => conn
                        .write(format!("{line}\n").as_bytes())
                        .context("Failed to send message")?,
                }
            }
        }
    }

    printer.abort();
    Ok(())
}
