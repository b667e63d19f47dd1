use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use civic_sync_core::db::Database;
use civic_sync_core::models::{Conflict, DeviceSyncCursor, QueuedAction};
use civic_sync_core::{SyncConfig, SyncEngine};
use serde::Serialize;

use crate::error::CliError;

const DEFAULT_DB_FILE: &str = "civic-sync.db";

pub fn resolve_db_path(cli_db_path: Option<PathBuf>) -> PathBuf {
    cli_db_path
        .or_else(|| env::var_os("CIVIC_SYNC_DATABASE_PATH").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DB_FILE))
}

/// Open the engine with the same `SYNC_*` tuning the API server uses
pub async fn open_engine(path: &Path) -> Result<SyncEngine, CliError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let config = SyncConfig::from_env()?;
    let db = Arc::new(Database::open(path).await?);
    Ok(SyncEngine::local(db, config))
}

#[derive(Debug, Serialize)]
pub struct ConflictItem {
    pub id: String,
    pub entity: String,
    pub user_id: String,
    pub device_id: String,
    pub client_version: i64,
    pub server_version: i64,
    pub strategy: String,
    pub resolved: bool,
    pub detected_at_iso: String,
}

pub fn conflict_to_item(conflict: &Conflict) -> ConflictItem {
    ConflictItem {
        id: conflict.id.to_string(),
        entity: format!("{}/{}", conflict.entity_type, conflict.entity_id),
        user_id: conflict.user_id.clone(),
        device_id: conflict.device_id.clone(),
        client_version: conflict.client_version,
        server_version: conflict.server_version,
        strategy: conflict.strategy_used.to_string(),
        resolved: conflict.resolved,
        detected_at_iso: format_timestamp(conflict.detected_at),
    }
}

pub fn format_conflict_lines(conflicts: &[Conflict]) -> Vec<String> {
    conflicts
        .iter()
        .map(|conflict| {
            format!(
                "{}  {}  {:<11}  {}/{}  client={} server={}  {}",
                format_timestamp(conflict.detected_at),
                conflict.id,
                conflict.strategy_used.as_str(),
                conflict.entity_type,
                conflict.entity_id,
                conflict.client_version,
                conflict.server_version,
                if conflict.resolved { "resolved" } else { "open" }
            )
        })
        .collect()
}

pub fn format_cursor_lines(cursors: &[DeviceSyncCursor]) -> Vec<String> {
    cursors
        .iter()
        .map(|cursor| {
            let download = cursor
                .last_download_at
                .map_or_else(|| "never".to_string(), format_timestamp);
            let status = cursor.retired_at.map_or_else(
                || "active".to_string(),
                |at| format!("retired {}", format_timestamp(at)),
            );
            format!(
                "{:<24}  version={:<8}  downloaded={}  {}",
                cursor.device_id, cursor.last_sync_version, download, status
            )
        })
        .collect()
}

pub fn format_action_lines(actions: &[QueuedAction]) -> Vec<String> {
    actions
        .iter()
        .map(|action| {
            let mut line = format!(
                "{}  {:<10}  {} {}/{}  attempts={}/{}",
                format_timestamp(action.enqueued_at),
                action.outcome.as_str(),
                action.action_kind.as_str(),
                action.entity_type,
                action.entity_id,
                action.attempt_count,
                action.max_attempts
            );
            if let Some(reason) = &action.failure_reason {
                line.push_str("  reason=");
                line.push_str(reason);
            }
            line
        })
        .collect()
}

pub fn format_timestamp(timestamp_ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(timestamp_ms).map_or_else(
        || timestamp_ms.to_string(),
        |date_time| date_time.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
    )
}
