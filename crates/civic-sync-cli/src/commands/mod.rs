pub mod common;
pub mod conflicts;
pub mod cursors;
pub mod queue;
