//! civic-sync CLI - operator tooling for the sync engine database
//!
//! Inspect conflicts, cursors and the action queue, and settle manual
//! conflicts without going through the HTTP API.

mod cli;
mod commands;
mod error;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Commands};
use crate::commands::common::{open_engine, resolve_db_path};
use crate::commands::conflicts::{run_conflicts, run_resolve};
use crate::commands::cursors::{run_cursors, run_purge_devices, run_retire_device};
use crate::commands::queue::{run_drain, run_queue};
use crate::error::CliError;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("civic_sync_core=warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let db_path = resolve_db_path(cli.db_path);
    let engine = open_engine(&db_path).await?;

    match cli.command {
        Commands::Conflicts {
            user,
            device,
            all,
            json,
        } => run_conflicts(&engine, user.as_deref(), device.as_deref(), all, json).await?,
        Commands::Resolve {
            id,
            payload,
            delete,
            abandon,
        } => run_resolve(&engine, &id, payload.as_deref(), delete, abandon).await?,
        Commands::Cursors { user, json } => run_cursors(&engine, &user, json).await?,
        Commands::RetireDevice { user, device } => {
            run_retire_device(&engine, &user, &device).await?;
        }
        Commands::PurgeDevices { older_than_days } => {
            run_purge_devices(&engine, older_than_days).await?;
        }
        Commands::Drain { limit, json } => run_drain(&engine, limit, json).await?,
        Commands::Queue {
            user,
            device,
            limit,
            json,
        } => run_queue(&engine, &user, &device, limit, json).await?,
    }

    Ok(())
}
