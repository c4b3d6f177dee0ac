use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use clap::Parser;
use jackal_xmpp::{InMemoryRepository, XmppCore};
use tracing::info;

mod config;
mod telemetry;

use config::ServerConfig;

/// Jackal - XMPP server
#[derive(Parser)]
#[command(name = "jackal-server")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long, default_value = "jackal.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = ServerConfig::load(&cli.config)?;
    telemetry::init(&config.log).map_err(|e| anyhow!("Failed to initialize logging: {}", e))?;

    info!("Jackal starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let core = XmppCore::builder(config.xmpp)
        .repository(Arc::new(InMemoryRepository::new()))
        .build()?;
    core.start().await?;

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    core.shutdown().await;
    telemetry::shutdown();
    Ok(())
}
