//! Data models for civic-sync

mod action;
mod conflict;
mod cursor;
mod record;

pub use action::{
    validate_identifier, ActionId, ActionKind, ActionOutcome, ActionResult, NewAction,
    QueuedAction, DEFAULT_MAX_ATTEMPTS,
};
pub use conflict::{Conflict, ConflictId, ManualResolution, ResolutionStrategy};
pub use cursor::DeviceSyncCursor;
pub use record::{Change, StoredRecord};
