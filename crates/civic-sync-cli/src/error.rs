use std::io;

use civic_sync_core::config::ConfigError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Core(#[from] civic_sync_core::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("Invalid conflict ID: {0}")]
    InvalidConflictId(String),
    #[error("Resolution payload must be a JSON object: {0}")]
    InvalidPayload(String),
    #[error("Choose one of --payload, --delete or --abandon")]
    MissingResolution,
}
