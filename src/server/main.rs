//! GhostCat Relay - Main Entry Point
//!
//! Long-running TLS relay with LAN discovery broadcast.

use anyhow::Result;
use clap::Parser;
use log::{info, warn};
use std::path::PathBuf;

use ghostcat::{RelayServer, ServerConfig};

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "ghostcat-server")]
#[command(about = "GhostCat relay - forwards end-to-end encrypted messages")]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config/server.toml")]
    config: PathBuf,

    /// Override host to bind to
    #[arg(long)]
    host: Option<String>,

    /// Override listening port (0 for an ephemeral port)
    #[arg(short, long)]
    port: Option<u16>,

    /// Disable the LAN discovery broadcast
    #[arg(long)]
    no_discovery: bool,

    /// Stop once the last client disconnects
    #[arg(long)]
    auto_shutdown: bool,

    /// Log level
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = if args.config.exists() {
        ServerConfig::from_file(&args.config.to_string_lossy())?
    } else {
        ServerConfig::default()
    };

    let log_level = args.log_level.clone().unwrap_or(config.log_level.clone());
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&log_level)).init();

    if !args.config.exists() {
        info!("Config file {} not found, using defaults", args.config.display());
    }

    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if args.no_discovery {
        config.discovery = false;
    }
    if args.auto_shutdown {
        config.auto_shutdown = true;
    }

    let server = RelayServer::from_config(config)?;
    let addr = server.start().await?;
    info!("GhostCat relay ready on {}", addr);

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                warn!("Failed to listen for Ctrl+C: {}", e);
            }
            info!("Shutting down");
            server.stop().await;
        }
        _ = server.wait_stopped() => {}
    }

    Ok(())
}
