use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use cloudbridge::{ClientConfig, FileConfig, LogLevel};
use tracing_subscriber::prelude::*;

mod cli;

#[derive(Parser)]
#[command(name = "cloudbridge")]
#[command(about = "Peer connections and TCP tunnels through the CloudBridge relay")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Authentication token (or set CLOUDBRIDGE_TOKEN)
    #[arg(short, long, global = true)]
    token: Option<String>,

    /// Relay region
    #[arg(short, long, global = true)]
    region: Option<String>,

    /// Relay handshake timeout in seconds
    #[arg(long, global = true)]
    timeout: Option<u64>,

    /// Skip TLS certificate verification (development only)
    #[arg(long, global = true)]
    insecure_skip_verify: bool,

    /// Full relay URL, replacing the region-derived one
    #[arg(long, global = true)]
    relay_url: Option<String>,

    /// TOML config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to a peer and exchange messages
    Connect(ConnectArgs),

    /// Forward a local TCP port to a port on a remote peer
    Tunnel(TunnelArgs),

    /// Accept inbound peers and tunnel requests until Ctrl-C
    Serve,

    /// Print version information
    Version,
}

#[derive(Parser)]
struct ConnectArgs {
    /// Peer ID to connect to
    peer_id: String,

    /// Send a single message, wait briefly for a reply, then exit
    #[arg(short, long)]
    message: Option<String>,
}

#[derive(Parser)]
struct TunnelArgs {
    /// Remote peer ID
    peer_id: String,

    /// Local port to listen on (0 = auto-select)
    #[arg(short, long)]
    local_port: u16,

    /// Port of the service on the remote peer
    #[arg(short = 'p', long)]
    remote_port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Version = cli.command {
        println!("cloudbridge {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let config = resolve_config(&cli)?;
    init_tracing(config.log_level, cli.verbose);

    match cli.command {
        Commands::Connect(args) => {
            cli::connect::connect_command(config, &args.peer_id, args.message).await
        }
        Commands::Tunnel(args) => {
            cli::tunnel::tunnel_command(config, &args.peer_id, args.local_port, args.remote_port)
                .await
        }
        Commands::Serve => cli::serve::serve_command(config).await,
        Commands::Version => Ok(()),
    }
}

/// Defaults → config file → `CLOUDBRIDGE_*` env vars → command-line flags.
fn resolve_config(cli: &Cli) -> Result<ClientConfig> {
    let mut fc: FileConfig = cloudbridge::load_config(cli.config.as_deref())
        .extract()
        .context("Failed to load configuration")?;

    if let Some(token) = &cli.token {
        fc.token = Some(token.clone());
    }
    if let Some(region) = &cli.region {
        fc.region = region.clone();
    }
    if let Some(timeout) = cli.timeout {
        fc.timeout_secs = timeout;
    }
    if let Some(url) = &cli.relay_url {
        fc.relay_url = Some(url.clone());
    }
    if cli.insecure_skip_verify {
        fc.insecure_skip_verify = true;
    }

    let config = ClientConfig::from_file(&fc);
    config
        .validate()
        .context("Invalid configuration (set --token or CLOUDBRIDGE_TOKEN)")?;
    Ok(config)
}

fn init_tracing(level: LogLevel, verbose: bool) {
    let level = if verbose { "debug" } else { level.as_str() };
    let default_directive = format!("cloudbridge={level},cloudbridge_cli={level},warn");
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();
}
