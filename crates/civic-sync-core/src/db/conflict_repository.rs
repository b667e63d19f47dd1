//! Conflict persistence

use libsql::{params, Connection, Row};
use serde_json::Value;

use super::{json_value, parse_json};
use crate::error::{Error, Result};
use crate::models::{Conflict, ConflictId, ResolutionStrategy};

const CONFLICT_COLUMNS: &str = "id, action_id, user_id, device_id, entity_type, entity_id, \
     client_version, server_version, detected_at, strategy_used, resolved, resolved_at, \
     resolved_payload, discarded_fields";

/// Repository for detected version conflicts
pub struct ConflictRepository<'a> {
    conn: &'a Connection,
}

impl<'a> ConflictRepository<'a> {
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub async fn insert(&self, conflict: &Conflict) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO sync_conflicts (
                    id, action_id, user_id, device_id, entity_type, entity_id,
                    client_version, server_version, detected_at, strategy_used,
                    resolved, resolved_at, resolved_payload, discarded_fields
                 ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                params![
                    conflict.id.as_str(),
                    conflict.action_id.as_str(),
                    conflict.user_id.as_str(),
                    conflict.device_id.as_str(),
                    conflict.entity_type.as_str(),
                    conflict.entity_id.as_str(),
                    conflict.client_version,
                    conflict.server_version,
                    conflict.detected_at,
                    conflict.strategy_used.as_str(),
                    i32::from(conflict.resolved),
                    super::opt_int(conflict.resolved_at),
                    json_value(conflict.resolved_payload.as_ref())?,
                    json_value(conflict.discarded_fields.as_ref())?
                ],
            )
            .await?;
        Ok(())
    }

    pub async fn get(&self, id: &ConflictId) -> Result<Option<Conflict>> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {CONFLICT_COLUMNS} FROM sync_conflicts WHERE id = ?"),
                params![id.as_str()],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(Self::parse_conflict(&row)?)),
            None => Ok(None),
        }
    }

    /// Conflicts raised by a device's actions, oldest first
    ///
    /// `resolved = None` returns both open and closed conflicts.
    pub async fn list_for_device(
        &self,
        user_id: &str,
        device_id: &str,
        resolved: Option<bool>,
    ) -> Result<Vec<Conflict>> {
        let mut rows = match resolved {
            Some(resolved) => {
                self.conn
                    .query(
                        &format!(
                            "SELECT {CONFLICT_COLUMNS} FROM sync_conflicts
                             WHERE user_id = ? AND device_id = ? AND resolved = ?
                             ORDER BY detected_at ASC, id ASC"
                        ),
                        params![user_id, device_id, i32::from(resolved)],
                    )
                    .await?
            }
            None => {
                self.conn
                    .query(
                        &format!(
                            "SELECT {CONFLICT_COLUMNS} FROM sync_conflicts
                             WHERE user_id = ? AND device_id = ?
                             ORDER BY detected_at ASC, id ASC"
                        ),
                        params![user_id, device_id],
                    )
                    .await?
            }
        };

        let mut conflicts = Vec::new();
        while let Some(row) = rows.next().await? {
            conflicts.push(Self::parse_conflict(&row)?);
        }
        Ok(conflicts)
    }

    /// Every unresolved conflict, oldest first (operator view)
    pub async fn list_unresolved(&self) -> Result<Vec<Conflict>> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {CONFLICT_COLUMNS} FROM sync_conflicts
                     WHERE resolved = 0 ORDER BY detected_at ASC, id ASC"
                ),
                (),
            )
            .await?;

        let mut conflicts = Vec::new();
        while let Some(row) = rows.next().await? {
            conflicts.push(Self::parse_conflict(&row)?);
        }
        Ok(conflicts)
    }

    /// Close an open conflict; returns false when it was already resolved
    pub async fn mark_resolved(
        &self,
        id: &ConflictId,
        resolved_payload: Option<&Value>,
        discarded_fields: Option<&Value>,
    ) -> Result<bool> {
        let now = chrono::Utc::now().timestamp_millis();
        let rows = self
            .conn
            .execute(
                "UPDATE sync_conflicts SET
                    resolved = 1,
                    resolved_at = ?,
                    resolved_payload = ?,
                    discarded_fields = ?
                 WHERE id = ? AND resolved = 0",
                params![
                    now,
                    json_value(resolved_payload)?,
                    json_value(discarded_fields)?,
                    id.as_str()
                ],
            )
            .await?;
        Ok(rows == 1)
    }

    /// Record that the server moved on while a manual resolution was pending
    pub async fn refresh_server_version(&self, id: &ConflictId, server_version: i64) -> Result<()> {
        self.conn
            .execute(
                "UPDATE sync_conflicts SET server_version = ? WHERE id = ? AND resolved = 0",
                params![server_version, id.as_str()],
            )
            .await?;
        Ok(())
    }

    fn parse_conflict(row: &Row) -> Result<Conflict> {
        let id: String = row.get(0)?;
        let action_id: String = row.get(1)?;
        let strategy: String = row.get(9)?;

        Ok(Conflict {
            id: id
                .parse()
                .map_err(|e| Error::Database(format!("invalid conflict id {id}: {e}")))?,
            action_id: action_id
                .parse()
                .map_err(|e| Error::Database(format!("invalid action id {action_id}: {e}")))?,
            user_id: row.get(2)?,
            device_id: row.get(3)?,
            entity_type: row.get(4)?,
            entity_id: row.get(5)?,
            client_version: row.get(6)?,
            server_version: row.get(7)?,
            detected_at: row.get(8)?,
            strategy_used: strategy
                .parse::<ResolutionStrategy>()
                .map_err(|e| Error::Database(e.to_string()))?,
            resolved: row.get::<i32>(10)? != 0,
            resolved_at: row.get::<Option<i64>>(11)?,
            resolved_payload: parse_json(row.get::<Option<String>>(12)?)?,
            discarded_fields: parse_json(row.get::<Option<String>>(13)?)?,
        })
    }
}
