//! Command line interface.

use crate::core::config::Config;
use crate::core::runtime::Runtime;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

/// Strata server CLI.
#[derive(Parser, Debug)]
#[command(name = "strata", version, about = "In-memory networked key-value cache")]
pub struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the server.
    Start,
    /// Validate the configuration file and exit.
    Check,
}

/// Initialize the tracing subscriber from `RUST_LOG`, defaulting to info.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .init();
}

/// Run the start command.
pub async fn run_start(config_path: &Path) -> Result<()> {
    init_tracing();

    let config = Config::from_file(config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    let mut runtime = Runtime::new(config)?;
    runtime.run().await
}

/// Validate a configuration file.
pub fn run_check(config_path: &Path) -> Result<()> {
    Config::from_file(config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;
    println!("configuration OK: {}", config_path.display());
    Ok(())
}
