//! Quay CLI - build and publish projects as hosted static sites
//!
//! Usage:
//!   quay init [path]       Write a default quay.toml
//!   quay serve             Run the API server and deployment engine

use anyhow::Result;
use clap::{Parser, Subcommand};
use quay_core::QuayConfig;
use quay_engine::Coordinator;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "quay")]
#[command(author, version, about = "Deployment engine for static sites")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Init {
        /// Where to write the config (defaults to ./quay.toml)
        #[arg(default_value = "quay.toml")]
        path: PathBuf,
    },

    /// Run the API server and deployment engine
    Serve {
        /// Configuration file (defaults to ./quay.toml)
        #[arg(short, long, default_value = "quay.toml")]
        config: PathBuf,

        /// Listen address override, e.g. 0.0.0.0:8370
        #[arg(long)]
        addr: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    match cli.command {
        Commands::Init { path } => cmd_init(path).await,
        Commands::Serve { config, addr } => cmd_serve(config, addr).await,
    }
}

async fn cmd_init(path: PathBuf) -> Result<()> {
    QuayConfig::write_default(&path)?;

    println!("Wrote default configuration to {}", path.display());
    println!("Edit it, then run 'quay serve' to start the engine");

    Ok(())
}

async fn cmd_serve(config_path: PathBuf, addr: Option<String>) -> Result<()> {
    let mut config = QuayConfig::load_or_default(&config_path)?;
    if let Some(addr) = addr {
        config.server.addr = addr;
    }

    info!(
        "Serving deployments from {} on {}",
        config.engine.output_root.display(),
        config.server.addr
    );

    let coordinator = Coordinator::from_config(&config);
    quay_server::serve(config, coordinator).await
}
