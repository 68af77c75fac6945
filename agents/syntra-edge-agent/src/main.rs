//! Syntra Edge Agent CLI Entry Point
//!
//! This is the main entry point for the edge agent binary.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

use syntra_edge_agent::builder::build_agent;
use syntra_edge_agent::cli::config::Config;
use syntra_edge_agent::logging::init_logging;

#[derive(Parser)]
#[command(name = "syntra-edge-agent")]
#[command(author, version, about = "Syntra Edge Agent - twin configuration and state synchronization")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the agent
    Start {
        /// Path to configuration file
        #[arg(short, long, default_value = "config/edge-agent.toml", env = "SYNTRA_EDGE_CONFIG")]
        config: PathBuf,
    },
    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start { config } => start_agent(&config).await?,
        Commands::Version => show_version(),
    }

    Ok(())
}

async fn start_agent(config_path: &PathBuf) -> Result<()> {
    let config = Config::load(config_path)?;
    init_logging(&config.logging)?;

    info!(
        device_id = %config.device_id,
        hub = %config.hub_hostname,
        "Starting Syntra Edge Agent"
    );

    let agent = build_agent(&config)?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    info!("Shutdown requested");
    agent.shutdown().await;
    info!("Syntra Edge Agent stopped");

    Ok(())
}

fn show_version() {
    println!("syntra-edge-agent {}", env!("CARGO_PKG_VERSION"));
    println!("Twin configuration and state synchronization for edge devices");
    println!();
    println!("Features:");
    println!("  - Desired-state sync with encrypted offline backup");
    println!("  - Direct requests: ping, uploadLogs, getLogs, restartModule");
    println!("  - Log streaming");
    println!("  - Reported state for Docker modules");
}
