//! Error types for civic-sync-core

use std::time::Duration;

use thiserror::Error;

use crate::store::StoreError;

/// Result type alias using civic-sync-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in civic-sync-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed input, rejected before anything is stored
    #[error("Validation error: {0}")]
    Validation(String),

    /// Caller may not read or write the requested entity type
    #[error("Authorization denied: {0}")]
    AuthorizationDenied(String),

    /// Idempotency key or entity id already claimed elsewhere
    #[error("Uniqueness violation: {0}")]
    UniquenessViolation(String),

    /// Queue entry, conflict or cursor not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Entity store adapter failure
    #[error("Entity store error: {0}")]
    Store(#[from] StoreError),

    /// libSQL error
    #[error("libSQL error: {0}")]
    LibSql(#[from] libsql::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Session exceeded its time budget
    #[error("Sync session exceeded its time budget of {}ms", .0.as_millis())]
    SessionTimeout(Duration),

    /// Download page token could not be decoded
    #[error("Invalid page token: {0}")]
    InvalidPageToken(String),

    /// Manual resolution raced a newer server write
    #[error("Conflict {conflict_id} is stale: server is now at version {server_version}")]
    StaleResolution {
        conflict_id: String,
        server_version: i64,
    },

    /// Database row could not be interpreted
    #[error("Database error: {0}")]
    Database(String),
}

impl Error {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }
}
