//! libSQL-backed entity store
//!
//! Versions come from the single-row `version_counter` table. Each write reads
//! the counter inside the same statement that stores the record, and the
//! `records_ai`/`records_au` triggers advance it, so issuance and write are
//! one atomic step and version N+1 can never be visible before N.

#![allow(clippy::cast_possible_wrap)] // SQLite uses i64 for LIMIT

use std::sync::Arc;

use async_trait::async_trait;
use libsql::params::{IntoParams, Params};
use libsql::{params, Row, Value};
use serde_json::Value as Json;

use super::{EntityStore, StoreError, StoreResult};
use crate::db::{parse_json, Database};
use crate::models::{Change, StoredRecord};
use crate::sync::Visibility;

const RECORD_COLUMNS: &str =
    "entity_type, entity_id, version, payload, deleted, updated_at, last_action";

const NEXT_VERSION: &str = "(SELECT value FROM version_counter WHERE id = 1) + 1";

/// Entity store over the sync database's `records` table
#[derive(Clone)]
pub struct LibSqlEntityStore {
    db: Arc<Database>,
}

impl LibSqlEntityStore {
    pub const fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Work out why a guarded write touched no row
    async fn mismatch(&self, entity_type: &str, entity_id: &str) -> StoreError {
        match self.get(entity_type, entity_id).await {
            Ok(Some(record)) if !record.deleted => StoreError::VersionMismatch {
                current: record.version,
            },
            Ok(_) => StoreError::NotFound(format!("{entity_type}/{entity_id}")),
            Err(error) => error,
        }
    }

    async fn returned_version(
        &self,
        sql: &str,
        params: impl IntoParams,
    ) -> StoreResult<Option<i64>> {
        let mut rows = self.db.connection().query(sql, params).await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row.get::<i64>(0)?)),
            None => Ok(None),
        }
    }

    fn parse_record(row: &Row) -> StoreResult<StoredRecord> {
        Ok(StoredRecord {
            entity_type: row.get(0)?,
            entity_id: row.get(1)?,
            version: row.get(2)?,
            payload: parse_json(row.get::<Option<String>>(3)?)
                .map_err(|e| StoreError::Permanent(e.to_string()))?,
            deleted: row.get::<i32>(4)? != 0,
            updated_at: row.get(5)?,
            last_action: row.get(6)?,
        })
    }
}

#[async_trait]
impl EntityStore for LibSqlEntityStore {
    async fn get(&self, entity_type: &str, entity_id: &str) -> StoreResult<Option<StoredRecord>> {
        let mut rows = self
            .db
            .connection()
            .query(
                &format!(
                    "SELECT {RECORD_COLUMNS} FROM records WHERE entity_type = ? AND entity_id = ?"
                ),
                params![entity_type, entity_id],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(Self::parse_record(&row)?)),
            None => Ok(None),
        }
    }

    async fn create_as(
        &self,
        entity_type: &str,
        entity_id: &str,
        payload: &Json,
        origin: Option<&str>,
    ) -> StoreResult<i64> {
        let now = chrono::Utc::now().timestamp_millis();
        let version = self
            .returned_version(
                &format!(
                    "INSERT INTO records ({RECORD_COLUMNS})
                     VALUES (?, ?, {NEXT_VERSION}, ?, 0, ?, ?)
                     ON CONFLICT(entity_type, entity_id) DO NOTHING
                     RETURNING version"
                ),
                params![
                    entity_type,
                    entity_id,
                    serde_json::to_string(payload)?,
                    now,
                    origin
                ],
            )
            .await?;

        version.ok_or_else(|| StoreError::AlreadyExists(format!("{entity_type}/{entity_id}")))
    }

    async fn put_as(
        &self,
        entity_type: &str,
        entity_id: &str,
        payload: &Json,
        expected_version: i64,
        origin: Option<&str>,
    ) -> StoreResult<i64> {
        let now = chrono::Utc::now().timestamp_millis();
        let version = self
            .returned_version(
                &format!(
                    "UPDATE records
                     SET version = {NEXT_VERSION}, payload = ?, deleted = 0, updated_at = ?, last_action = ?
                     WHERE entity_type = ? AND entity_id = ? AND version = ? AND deleted = 0
                     RETURNING version"
                ),
                params![
                    serde_json::to_string(payload)?,
                    now,
                    origin,
                    entity_type,
                    entity_id,
                    expected_version
                ],
            )
            .await?;

        match version {
            Some(version) => Ok(version),
            None => Err(self.mismatch(entity_type, entity_id).await),
        }
    }

    async fn delete_as(
        &self,
        entity_type: &str,
        entity_id: &str,
        expected_version: i64,
        origin: Option<&str>,
    ) -> StoreResult<i64> {
        let now = chrono::Utc::now().timestamp_millis();
        let version = self
            .returned_version(
                &format!(
                    "UPDATE records
                     SET version = {NEXT_VERSION}, payload = NULL, deleted = 1, updated_at = ?, last_action = ?
                     WHERE entity_type = ? AND entity_id = ? AND version = ? AND deleted = 0
                     RETURNING version"
                ),
                params![now, origin, entity_type, entity_id, expected_version],
            )
            .await?;

        match version {
            Some(version) => Ok(version),
            None => Err(self.mismatch(entity_type, entity_id).await),
        }
    }

    async fn changes_since(
        &self,
        after_version: i64,
        visibility: &Visibility,
        limit: usize,
    ) -> StoreResult<Vec<Change>> {
        let mut values = vec![Value::Integer(after_version)];
        let type_filter = match visibility {
            Visibility::All => String::new(),
            Visibility::EntityTypes(types) if types.is_empty() => return Ok(Vec::new()),
            Visibility::EntityTypes(types) => {
                let placeholders: Vec<&str> = types.iter().map(|_| "?").collect();
                values.extend(types.iter().map(|t| Value::Text(t.clone())));
                format!(" AND entity_type IN ({})", placeholders.join(", "))
            }
        };
        values.push(Value::Integer(limit as i64));

        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM records
             WHERE version > ?{type_filter}
             ORDER BY version ASC LIMIT ?"
        );

        let mut rows = self
            .db
            .connection()
            .query(&sql, Params::Positional(values))
            .await?;

        let mut changes = Vec::new();
        while let Some(row) = rows.next().await? {
            changes.push(Change::from(Self::parse_record(&row)?));
        }
        Ok(changes)
    }

    async fn snapshot_at(
        &self,
        entity_type: &str,
        entity_id: &str,
        version: i64,
    ) -> StoreResult<Option<Json>> {
        let mut rows = self
            .db
            .connection()
            .query(
                "SELECT payload, deleted FROM record_history
                 WHERE version = ? AND entity_type = ? AND entity_id = ?",
                params![version, entity_type, entity_id],
            )
            .await?;

        let Some(row) = rows.next().await? else {
            return Ok(None);
        };
        if row.get::<i32>(1)? != 0 {
            return Ok(None);
        }
        parse_json(row.get::<Option<String>>(0)?).map_err(|e| StoreError::Permanent(e.to_string()))
    }

    async fn current_version(&self) -> StoreResult<i64> {
        let mut rows = self
            .db
            .connection()
            .query("SELECT value FROM version_counter WHERE id = 1", ())
            .await?;
        match rows.next().await? {
            Some(row) => Ok(row.get(0)?),
            None => Ok(0),
        }
    }
}
