//! # fanrelay
//!
//! Relay binary: opens the database, wires the server crates together, and
//! serves until interrupted.

#![deny(unsafe_code)]

mod config;

use anyhow::{Context, Result};
use clap::Parser;
use fanrelay_logging::init_logging;
use fanrelay_store::Database;

use crate::config::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let _logging = init_logging(&cli.logging_config());

    let db_path = cli.database_path();
    let db = Database::open(&db_path)
        .with_context(|| format!("Failed to open database: {}", db_path.display()))?;

    let handle = fanrelay_server::start(cli.server_config(), db)
        .await
        .with_context(|| format!("Failed to bind {}:{}", cli.host, cli.port))?;
    tracing::info!(port = handle.port, "fanrelay ready");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl+c")?;

    tracing::info!("shutting down");
    handle.shutdown().await;
    Ok(())
}
