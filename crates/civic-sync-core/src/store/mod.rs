//! Entity store adapter
//!
//! The sync engine never touches domain tables directly. Everything it needs
//! from the authoritative record store goes through [`EntityStore`]: keyed
//! reads, version-guarded writes, and version-ordered change scans.

mod sqlite;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::models::{Change, StoredRecord};
use crate::sync::Visibility;

pub use sqlite::LibSqlEntityStore;

/// Failures reported by an entity store
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store is temporarily unavailable; the write may be retried
    #[error("entity store temporarily unavailable: {0}")]
    Transient(String),

    /// The store rejected the operation for good
    #[error("entity store rejected the operation: {0}")]
    Permanent(String),

    /// Compare-and-swap lost against a newer write
    #[error("version mismatch: record is now at version {current}")]
    VersionMismatch { current: i64 },

    /// A create collided with an existing (or tombstoned) record
    #[error("entity {0} already exists")]
    AlreadyExists(String),

    #[error("entity {0} not found")]
    NotFound(String),
}

impl StoreError {
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<libsql::Error> for StoreError {
    fn from(error: libsql::Error) -> Self {
        let message = error.to_string();
        let lowered = message.to_ascii_lowercase();
        if lowered.contains("locked") || lowered.contains("busy") {
            Self::Transient(message)
        } else {
            Self::Permanent(message)
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(error: serde_json::Error) -> Self {
        Self::Permanent(error.to_string())
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Authoritative keyed record store with store-wide monotonic versions
///
/// Every successful write returns a version strictly greater than any version
/// issued before it, across all entity types.
#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Current record, tombstones included
    async fn get(&self, entity_type: &str, entity_id: &str) -> StoreResult<Option<StoredRecord>>;

    /// Insert a new record; fails with `AlreadyExists` if the id was ever used
    ///
    /// `origin` names the queued action performing the write and is kept on
    /// the record until the next write.
    async fn create_as(
        &self,
        entity_type: &str,
        entity_id: &str,
        payload: &Value,
        origin: Option<&str>,
    ) -> StoreResult<i64>;

    /// Replace the payload if the record is still at `expected_version`
    async fn put_as(
        &self,
        entity_type: &str,
        entity_id: &str,
        payload: &Value,
        expected_version: i64,
        origin: Option<&str>,
    ) -> StoreResult<i64>;

    /// Tombstone the record if it is still at `expected_version`
    async fn delete_as(
        &self,
        entity_type: &str,
        entity_id: &str,
        expected_version: i64,
        origin: Option<&str>,
    ) -> StoreResult<i64>;

    /// Write made outside the sync queue
    async fn create(
        &self,
        entity_type: &str,
        entity_id: &str,
        payload: &Value,
    ) -> StoreResult<i64> {
        self.create_as(entity_type, entity_id, payload, None).await
    }

    async fn put(
        &self,
        entity_type: &str,
        entity_id: &str,
        payload: &Value,
        expected_version: i64,
    ) -> StoreResult<i64> {
        self.put_as(entity_type, entity_id, payload, expected_version, None)
            .await
    }

    async fn delete(
        &self,
        entity_type: &str,
        entity_id: &str,
        expected_version: i64,
    ) -> StoreResult<i64> {
        self.delete_as(entity_type, entity_id, expected_version, None)
            .await
    }

    /// Records with version greater than `after_version`, ascending by version
    async fn changes_since(
        &self,
        after_version: i64,
        visibility: &Visibility,
        limit: usize,
    ) -> StoreResult<Vec<Change>>;

    /// Payload of the record as written at exactly `version`, if retained
    async fn snapshot_at(
        &self,
        entity_type: &str,
        entity_id: &str,
        version: i64,
    ) -> StoreResult<Option<Value>>;

    /// Highest version issued so far
    async fn current_version(&self) -> StoreResult<i64>;
}
