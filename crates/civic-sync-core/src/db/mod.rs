//! Database layer for civic-sync

mod connection;
mod conflict_repository;
mod cursor_repository;
mod migrations;
mod queue_repository;
mod rows;

pub use connection::Database;
pub use conflict_repository::ConflictRepository;
pub use cursor_repository::CursorRepository;
pub use queue_repository::{EnqueueOutcome, QueueRepository};
pub(crate) use rows::{json_value, opt_int, opt_text, parse_json};
