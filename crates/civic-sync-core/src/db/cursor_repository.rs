//! Sync state registry: per-device cursor persistence

use libsql::{params, Connection, Row};
use serde_json::Value;

use super::{json_value, opt_int, parse_json};
use crate::error::{Error, Result};
use crate::models::DeviceSyncCursor;

const CURSOR_COLUMNS: &str = "user_id, device_id, last_sync_version, last_upload_at, \
     last_download_at, device_metadata, created_at, retired_at";

/// Repository for (user, device) cursors
pub struct CursorRepository<'a> {
    conn: &'a Connection,
}

impl<'a> CursorRepository<'a> {
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Load the device's cursor, creating it at version 0 on first sync
    ///
    /// A retired device that syncs again is reactivated.
    pub async fn load_or_create(
        &self,
        user_id: &str,
        device_id: &str,
        device_metadata: Option<&Value>,
    ) -> Result<DeviceSyncCursor> {
        let now = chrono::Utc::now().timestamp_millis();
        self.conn
            .execute(
                "INSERT INTO device_cursors (user_id, device_id, last_sync_version, device_metadata, created_at)
                 VALUES (?, ?, 0, ?, ?)
                 ON CONFLICT(user_id, device_id) DO UPDATE SET
                    device_metadata = COALESCE(excluded.device_metadata, device_cursors.device_metadata),
                    retired_at = NULL",
                params![user_id, device_id, json_value(device_metadata)?, now],
            )
            .await?;

        self.get(user_id, device_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("cursor for device {device_id}")))
    }

    pub async fn get(&self, user_id: &str, device_id: &str) -> Result<Option<DeviceSyncCursor>> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {CURSOR_COLUMNS} FROM device_cursors WHERE user_id = ? AND device_id = ?"
                ),
                params![user_id, device_id],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(Self::parse_cursor(&row)?)),
            None => Ok(None),
        }
    }

    /// Advance the cursor to `observed_version`; never moves it backwards
    pub async fn commit(
        &self,
        user_id: &str,
        device_id: &str,
        observed_version: i64,
        uploaded_at: Option<i64>,
        downloaded_at: Option<i64>,
    ) -> Result<DeviceSyncCursor> {
        let rows = self
            .conn
            .execute(
                "UPDATE device_cursors SET
                    last_sync_version = MAX(last_sync_version, ?),
                    last_upload_at = COALESCE(?, last_upload_at),
                    last_download_at = COALESCE(?, last_download_at)
                 WHERE user_id = ? AND device_id = ?",
                params![
                    observed_version,
                    opt_int(uploaded_at),
                    opt_int(downloaded_at),
                    user_id,
                    device_id
                ],
            )
            .await?;

        if rows == 0 {
            return Err(Error::not_found(format!("cursor for device {device_id}")));
        }

        self.get(user_id, device_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("cursor for device {device_id}")))
    }

    /// All devices registered for a user, most recently created first
    pub async fn list_for_user(&self, user_id: &str) -> Result<Vec<DeviceSyncCursor>> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {CURSOR_COLUMNS} FROM device_cursors WHERE user_id = ?
                     ORDER BY created_at DESC, device_id ASC"
                ),
                params![user_id],
            )
            .await?;

        let mut cursors = Vec::new();
        while let Some(row) = rows.next().await? {
            cursors.push(Self::parse_cursor(&row)?);
        }
        Ok(cursors)
    }

    /// Mark a device inactive; its cursor becomes eligible for purging
    pub async fn retire(&self, user_id: &str, device_id: &str) -> Result<()> {
        let now = chrono::Utc::now().timestamp_millis();
        let rows = self
            .conn
            .execute(
                "UPDATE device_cursors SET retired_at = ?
                 WHERE user_id = ? AND device_id = ? AND retired_at IS NULL",
                params![now, user_id, device_id],
            )
            .await?;

        if rows == 0 {
            return Err(Error::not_found(format!("active device {device_id}")));
        }
        Ok(())
    }

    /// Delete cursors retired before `retired_before` (unix ms); active cursors are never removed
    pub async fn purge_retired(&self, retired_before: i64) -> Result<u64> {
        let rows = self
            .conn
            .execute(
                "DELETE FROM device_cursors WHERE retired_at IS NOT NULL AND retired_at < ?",
                params![retired_before],
            )
            .await?;
        Ok(rows)
    }

    fn parse_cursor(row: &Row) -> Result<DeviceSyncCursor> {
        Ok(DeviceSyncCursor {
            user_id: row.get(0)?,
            device_id: row.get(1)?,
            last_sync_version: row.get(2)?,
            last_upload_at: row.get::<Option<i64>>(3)?,
            last_download_at: row.get::<Option<i64>>(4)?,
            device_metadata: parse_json(row.get::<Option<String>>(5)?)?,
            created_at: row.get(6)?,
            retired_at: row.get::<Option<i64>>(7)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    async fn setup() -> Database {
        Database::open_in_memory().await.unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_load_or_create_is_unique_per_device() {
        let db = setup().await;
        let repo = CursorRepository::new(db.connection());

        let first = repo
            .load_or_create("user-1", "phone", Some(&json!({"os": "android"})))
            .await
            .unwrap();
        assert_eq!(first.last_sync_version, 0);
        assert!(first.is_active());

        let again = repo.load_or_create("user-1", "phone", None).await.unwrap();
        assert_eq!(again.created_at, first.created_at);
        assert_eq!(again.device_metadata, Some(json!({"os": "android"})));

        assert_eq!(repo.list_for_user("user-1").await.unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_commit_never_moves_backwards() {
        let db = setup().await;
        let repo = CursorRepository::new(db.connection());
        repo.load_or_create("user-1", "phone", None).await.unwrap();

        let advanced = repo
            .commit("user-1", "phone", 12, None, Some(1_000))
            .await
            .unwrap();
        assert_eq!(advanced.last_sync_version, 12);
        assert_eq!(advanced.last_download_at, Some(1_000));

        let stale = repo
            .commit("user-1", "phone", 7, Some(2_000), None)
            .await
            .unwrap();
        assert_eq!(stale.last_sync_version, 12);
        assert_eq!(stale.last_upload_at, Some(2_000));
        assert_eq!(stale.last_download_at, Some(1_000));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_commit_unknown_device_fails() {
        let db = setup().await;
        let repo = CursorRepository::new(db.connection());
        let err = repo.commit("user-1", "ghost", 1, None, None).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_purge_only_removes_retired_devices() {
        let db = setup().await;
        let repo = CursorRepository::new(db.connection());
        repo.load_or_create("user-1", "old-phone", None).await.unwrap();
        repo.load_or_create("user-1", "tablet", None).await.unwrap();

        repo.retire("user-1", "old-phone").await.unwrap();
        let purged = repo.purge_retired(i64::MAX).await.unwrap();
        assert_eq!(purged, 1);

        let remaining = repo.list_for_user("user-1").await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].device_id, "tablet");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_retired_device_is_reactivated_on_sync() {
        let db = setup().await;
        let repo = CursorRepository::new(db.connection());
        repo.load_or_create("user-1", "phone", None).await.unwrap();
        repo.commit("user-1", "phone", 4, None, None).await.unwrap();
        repo.retire("user-1", "phone").await.unwrap();

        let cursor = repo.load_or_create("user-1", "phone", None).await.unwrap();
        assert!(cursor.is_active());
        assert_eq!(cursor.last_sync_version, 4);
    }
}
