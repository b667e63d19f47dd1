//! civic-sync-core - Core library for civic-sync
//!
//! This crate contains the offline action queue, conflict detection and
//! resolution, incremental download, and the sync session orchestrator used
//! by the civic-sync API server and admin CLI.

pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod store;
pub mod sync;

pub use config::SyncConfig;
pub use error::{Error, Result};
pub use models::{ActionResult, Conflict, ConflictId, NewAction};
pub use sync::SyncEngine;
