//! # Parley Server
//!
//! Signaling server that lets peers find each other and relay connection
//! negotiation messages.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! parley
//!
//! # Run with custom config
//! parley --config /path/to/parley.toml
//!
//! # Raw socket transport on a different HTTP port
//! parley --server-type tcp --port 9100
//!
//! # Run with environment variables
//! PARLEY__PORT=8080 PARLEY__LIMITS__CONCURRENT_LIMIT=100 parley
//! ```

mod api;
mod app;
mod config;
mod metrics;

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "parley", version, about = "Peer signaling and relay server")]
struct Cli {
    /// Path to a TOML config file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// HTTP port, overriding the config file.
    #[arg(short, long)]
    port: Option<u16>,

    /// Transport adapter, overriding the config file.
    #[arg(long, value_enum)]
    server_type: Option<config::ServerType>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parley=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let mut config = config::Config::load(cli.config.as_deref())?;
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(server_type) = cli.server_type {
        config.server_type = server_type;
    }

    tracing::info!(
        server_type = ?config.server_type,
        "Starting Parley server on {}:{}",
        config.host,
        config.port
    );

    app::run(config).await?;

    Ok(())
}
