//! hoplined: hopline node daemon.
//!
//! ```bash
//! # Every pipeline stage: bridge the local compute process into the chain
//! RUST_LOG=info hoplined relay
//!
//! # Bandwidth discovery: one agent per compute node, one coordinator
//! hoplined agent
//! hoplined coordinator
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use hopline_core::config::HoplineConfig;

mod discovery;
mod hop;

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name    = "hoplined",
    version = env!("CARGO_PKG_VERSION"),
    about   = "hopline pipeline relay and bandwidth discovery"
)]
struct Cli {
    /// Config file. Defaults to $HOPLINE_CONFIG or ~/.config/hopline/config.toml.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Relay frames between the local compute process and the next node.
    Relay,

    /// Measure bandwidth to assigned peers and report to the coordinator.
    Agent,

    /// Schedule bandwidth probes and collect the cluster view.
    Coordinator,

    /// Write a default config file if none exists.
    InitConfig,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let path = cli.config.unwrap_or_else(HoplineConfig::file_path);

    if let Command::InitConfig = cli.command {
        let written = HoplineConfig::write_default_if_missing(&path)?;
        tracing::info!(path = %written.display(), "default config in place");
        return Ok(());
    }

    let config = HoplineConfig::load_from(&path)
        .with_context(|| format!("failed to load config from {}", path.display()))?;
    tracing::info!(path = %path.display(), node = %config.node.name, "config loaded");

    match cli.command {
        Command::Relay => hop::run(config).await,
        Command::Agent => discovery::run_agent(config).await,
        Command::Coordinator => discovery::run_coordinator(config).await,
        Command::InitConfig => Ok(()),
    }
}

/// Resolves on Ctrl-C or SIGTERM.
pub(crate) async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("shutdown signal received");
}
