//! # PigeonHub Signaling Server
//!
//! Routes WebRTC signaling between peers and, in hub mode, across a mesh
//! of federated hubs. The payloads stay opaque end to end.

use anyhow::Result;
use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

use pigeonhub_server::{Server, ServerConfig};

#[derive(Parser, Debug)]
#[command(name = "pigeonhub-server")]
#[command(about = "WebSocket signaling and peer-discovery server for WebRTC")]
#[command(version)]
struct Args {
    /// Bind host (overrides HOST)
    #[arg(short = 'a', long)]
    host: Option<String>,

    /// Bind port (overrides PORT)
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Structured JSON logs on stderr; level via RUST_LOG, default info.
    tracing_subscriber::fmt()
        .json()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(Level::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let args = Args::parse();
    let mut config = ServerConfig::from_env();
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }

    info!(
        host = %config.host,
        port = config.port,
        is_hub = config.is_hub,
        bootstrap_hubs = config.bootstrap_hubs.len(),
        "starting pigeonhub server"
    );

    let server = Server::new(config);
    let port = server.start().await?;
    info!(port, "listening");
    if let Some(hub_id) = server.state.hub_peer_id.as_deref() {
        info!(hub_peer_id = %hub_id, "hub mode enabled");
    }

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    server.shutdown().await;
    Ok(())
}
