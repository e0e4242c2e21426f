//! Strata - server entrypoint.
//!
//! Usage:
//!   strata start --config config/strata.toml
//!   strata check --config config/strata.toml

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use strata::cli::{run_check, run_start, Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .unwrap_or_else(|| PathBuf::from("config/strata.toml"));

    match cli.command {
        Commands::Start => run_start(&config_path).await,
        Commands::Check => run_check(&config_path),
    }
}
