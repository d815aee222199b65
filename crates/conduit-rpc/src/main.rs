//! Conduit RPC daemon - runs a bridge and exposes its administrative
//! surface as JSON-RPC 2.0 over HTTP.

mod handler;
mod server;

use anyhow::{Context, Result};
use clap::Parser;
use conduit_core::{BridgeConfig, BridgeOrchestrator};
use std::path::PathBuf;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "conduit-rpc")]
#[command(about = "JSON-RPC daemon for the Conduit bridge")]
struct Args {
    /// Bridge configuration file (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port to listen on (0 = auto-assign)
    #[arg(short, long, default_value = "0")]
    port: u16,

    /// Host to bind to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    info!("Starting Conduit RPC Server");

    let config = match &args.config {
        Some(path) => BridgeConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => BridgeConfig::default(),
    };

    let bridge = BridgeOrchestrator::from_config(&config)?;
    bridge.start().await?;
    for server in config.servers.iter().filter(|s| s.auto_start) {
        if let Err(e) = bridge.start_server(&server.id).await {
            warn!("Auto-start of {} failed: {}", server.id, e);
        }
    }

    let addr = server::start_server(bridge.clone(), &args.host, args.port).await?;

    // Read by supervisors of this daemon to discover the port.
    println!("RPC_PORT={}", addr.port());
    info!("RPC server running on {}", addr);

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, stopping bridge");
    bridge.stop().await;

    Ok(())
}
