//! Schema migrations for the sync database
//!
//! Each entry in [`MIGRATIONS`] runs once, inside its own transaction, and is
//! recorded in `schema_migrations`.

use libsql::Connection;

use crate::error::Result;

const MIGRATIONS: &[(i64, &[&str])] = &[
    (1, RECORDS_V1),
    (2, SYNC_STATE_V2),
    (3, RECORD_ORIGIN_V3),
];

/// Bring the schema up to the newest migration
pub async fn run(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY
        )",
        (),
    )
    .await?;

    let applied = applied_version(conn).await?;
    for (version, statements) in MIGRATIONS {
        if *version > applied {
            apply(conn, *version, statements).await?;
        }
    }
    Ok(())
}

async fn applied_version(conn: &Connection) -> Result<i64> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", ())
        .await?;
    match rows.next().await? {
        Some(row) => Ok(row.get(0)?),
        None => Ok(0),
    }
}

async fn apply(conn: &Connection, version: i64, statements: &[&str]) -> Result<()> {
    conn.execute("BEGIN IMMEDIATE", ()).await?;
    if let Err(error) = apply_statements(conn, version, statements).await {
        if let Err(rollback) = conn.execute("ROLLBACK", ()).await {
            tracing::warn!(version, error = %rollback, "rollback after failed migration failed");
        }
        return Err(error);
    }
    conn.execute("COMMIT", ()).await?;
    tracing::info!(version, "schema migration applied");
    Ok(())
}

async fn apply_statements(conn: &Connection, version: i64, statements: &[&str]) -> Result<()> {
    for statement in statements {
        conn.execute(statement, ()).await?;
    }
    conn.execute(
        "INSERT INTO schema_migrations (version) VALUES (?)",
        libsql::params![version],
    )
    .await?;
    Ok(())
}

/// Version 1: versioned entity records
///
/// Versions are issued from `version_counter` inside the writing statement and
/// the counter is advanced by trigger, so issuance and write are one atomic step.
const RECORDS_V1: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS version_counter (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        value INTEGER NOT NULL
    )",
    "INSERT OR IGNORE INTO version_counter (id, value) VALUES (1, 0)",
    "CREATE TABLE IF NOT EXISTS records (
        entity_type TEXT NOT NULL,
        entity_id TEXT NOT NULL,
        version INTEGER NOT NULL,
        payload TEXT,
        deleted INTEGER NOT NULL DEFAULT 0,
        updated_at INTEGER NOT NULL,
        PRIMARY KEY (entity_type, entity_id)
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_records_version ON records(version)",
    "CREATE INDEX IF NOT EXISTS idx_records_type_version ON records(entity_type, version)",
    // Append-only snapshots; lets merge recover the payload at a baseline version
    "CREATE TABLE IF NOT EXISTS record_history (
        version INTEGER PRIMARY KEY,
        entity_type TEXT NOT NULL,
        entity_id TEXT NOT NULL,
        payload TEXT,
        deleted INTEGER NOT NULL,
        recorded_at INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_record_history_entity ON record_history(entity_type, entity_id)",
    "CREATE TRIGGER IF NOT EXISTS records_ai AFTER INSERT ON records BEGIN
        UPDATE version_counter SET value = NEW.version WHERE id = 1;
        INSERT INTO record_history (version, entity_type, entity_id, payload, deleted, recorded_at)
        VALUES (NEW.version, NEW.entity_type, NEW.entity_id, NEW.payload, NEW.deleted, NEW.updated_at);
    END",
    "CREATE TRIGGER IF NOT EXISTS records_au AFTER UPDATE OF version ON records BEGIN
        UPDATE version_counter SET value = NEW.version WHERE id = 1;
        INSERT INTO record_history (version, entity_type, entity_id, payload, deleted, recorded_at)
        VALUES (NEW.version, NEW.entity_type, NEW.entity_id, NEW.payload, NEW.deleted, NEW.updated_at);
    END",
];

/// Version 2: cursors, offline action queue, conflicts
const SYNC_STATE_V2: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS device_cursors (
        user_id TEXT NOT NULL,
        device_id TEXT NOT NULL,
        last_sync_version INTEGER NOT NULL DEFAULT 0,
        last_upload_at INTEGER,
        last_download_at INTEGER,
        device_metadata TEXT,
        created_at INTEGER NOT NULL,
        retired_at INTEGER,
        PRIMARY KEY (user_id, device_id)
    )",
    "CREATE TABLE IF NOT EXISTS queued_actions (
        id TEXT PRIMARY KEY,
        user_id TEXT NOT NULL,
        device_id TEXT NOT NULL,
        client_entity_id TEXT NOT NULL,
        entity_type TEXT NOT NULL,
        entity_id TEXT NOT NULL,
        action_kind TEXT NOT NULL,
        payload TEXT,
        baseline_version INTEGER,
        baseline_payload TEXT,
        priority INTEGER NOT NULL DEFAULT 0,
        attempt_count INTEGER NOT NULL DEFAULT 0,
        max_attempts INTEGER NOT NULL DEFAULT 3,
        enqueued_at INTEGER NOT NULL,
        next_attempt_at INTEGER NOT NULL,
        applied_at INTEGER,
        outcome TEXT NOT NULL DEFAULT 'pending',
        failure_reason TEXT,
        retryable INTEGER NOT NULL DEFAULT 0,
        applied_version INTEGER,
        conflict_id TEXT
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_queue_client_entity
        ON queued_actions(entity_type, client_entity_id)",
    "CREATE INDEX IF NOT EXISTS idx_queue_dequeue
        ON queued_actions(outcome, next_attempt_at, priority DESC, enqueued_at)",
    "CREATE INDEX IF NOT EXISTS idx_queue_device ON queued_actions(user_id, device_id)",
    "CREATE TABLE IF NOT EXISTS sync_conflicts (
        id TEXT PRIMARY KEY,
        action_id TEXT NOT NULL REFERENCES queued_actions(id),
        user_id TEXT NOT NULL,
        device_id TEXT NOT NULL,
        entity_type TEXT NOT NULL,
        entity_id TEXT NOT NULL,
        client_version INTEGER NOT NULL,
        server_version INTEGER NOT NULL,
        detected_at INTEGER NOT NULL,
        strategy_used TEXT NOT NULL,
        resolved INTEGER NOT NULL DEFAULT 0,
        resolved_at INTEGER,
        resolved_payload TEXT,
        discarded_fields TEXT
    )",
    "CREATE INDEX IF NOT EXISTS idx_sync_conflicts_device
        ON sync_conflicts(user_id, device_id, resolved)",
    "CREATE INDEX IF NOT EXISTS idx_sync_conflicts_entity
        ON sync_conflicts(entity_type, entity_id)",
];

/// Version 3: the queued action behind each record's last write
const RECORD_ORIGIN_V3: &[&str] = &["ALTER TABLE records ADD COLUMN last_action TEXT"];
