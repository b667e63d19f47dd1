//! Sync database handle

use std::path::Path;

use libsql::{Builder, Connection, Database as LibSqlDatabase};

use super::migrations;
use crate::error::Result;

/// Pragmas tuned for a long-running server; WAL is refused by `:memory:`
const BEST_EFFORT_PRAGMAS: [&str; 3] = [
    "PRAGMA journal_mode = WAL;",
    "PRAGMA synchronous = NORMAL;",
    "PRAGMA busy_timeout = 5000;",
];

/// Shared libSQL handle for queue, cursor, conflict and record tables
///
/// Every write issued through this connection is a single statement, so
/// concurrent sessions can share it without explicit transactions.
pub struct Database {
    _db: LibSqlDatabase,
    conn: Connection,
}

impl Database {
    /// Open (or create) the sync database file and bring its schema current
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let location = path.as_ref().to_string_lossy().into_owned();
        let database = Self::prepare(Builder::new_local(&location).build().await?).await?;
        tracing::info!(path = %location, "sync database ready");
        Ok(database)
    }

    /// Throwaway database for tests and one-shot tooling
    pub async fn open_in_memory() -> Result<Self> {
        Self::prepare(Builder::new_local(":memory:").build().await?).await
    }

    async fn prepare(db: LibSqlDatabase) -> Result<Self> {
        let conn = db.connect()?;
        for pragma in BEST_EFFORT_PRAGMAS {
            if let Err(error) = conn.execute(pragma, ()).await {
                tracing::debug!(pragma, %error, "pragma not applied");
            }
        }
        conn.execute("PRAGMA foreign_keys = ON;", ()).await?;
        migrations::run(&conn).await?;
        Ok(Self { _db: db, conn })
    }

    pub const fn connection(&self) -> &Connection {
        &self.conn
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn scalar(db: &Database, sql: &str) -> i64 {
        let mut rows = db.connection().query(sql, ()).await.unwrap();
        rows.next().await.unwrap().unwrap().get::<i64>(0).unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn in_memory_database_enforces_foreign_keys() {
        let db = Database::open_in_memory().await.unwrap();
        assert_eq!(scalar(&db, "PRAGMA foreign_keys").await, 1);
        assert_eq!(scalar(&db, "SELECT COUNT(*) FROM device_cursors").await, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn reopening_a_file_keeps_rows() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("sync.db");

        {
            let db = Database::open(&path).await.unwrap();
            db.connection()
                .execute(
                    "INSERT INTO device_cursors (user_id, device_id, created_at) VALUES ('u', 'd', 0)",
                    (),
                )
                .await
                .unwrap();
        }

        let reopened = Database::open(&path).await.unwrap();
        assert_eq!(
            scalar(&reopened, "SELECT COUNT(*) FROM device_cursors").await,
            1
        );
    }
}
