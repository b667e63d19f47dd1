use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "civic-sync")]
#[command(about = "Inspect and operate the civic-sync engine database")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Path to the sync database
    #[arg(long, global = true, value_name = "PATH")]
    pub db_path: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List sync conflicts
    Conflicts {
        /// Only conflicts raised by this user
        #[arg(long, value_name = "USER")]
        user: Option<String>,
        /// Only conflicts raised by this device (requires --user)
        #[arg(long, value_name = "DEVICE", requires = "user")]
        device: Option<String>,
        /// Include resolved conflicts (requires --device)
        #[arg(long, requires = "device")]
        all: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Resolve a manual conflict
    Resolve {
        /// Conflict ID
        id: String,
        /// Record payload to write, as a JSON object
        #[arg(long, value_name = "JSON", conflicts_with_all = ["delete", "abandon"])]
        payload: Option<String>,
        /// Apply the conflicted delete
        #[arg(long, conflicts_with = "abandon")]
        delete: bool,
        /// Drop the client's change
        #[arg(long)]
        abandon: bool,
    },
    /// Show device cursors for a user
    Cursors {
        user: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Retire a device; its cursor is kept until purged
    RetireDevice { user: String, device: String },
    /// Delete cursors of devices retired long ago
    PurgeDevices {
        /// Minimum days since retirement
        #[arg(long, default_value = "30")]
        older_than_days: u32,
    },
    /// Apply due pending actions now
    Drain {
        /// Maximum actions to process
        #[arg(short, long, default_value = "100")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show queued actions submitted by a device
    Queue {
        user: String,
        device: String,
        /// Number of actions to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}
