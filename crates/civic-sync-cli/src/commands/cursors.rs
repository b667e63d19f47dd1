use chrono::{Duration, Utc};
use civic_sync_core::SyncEngine;

use crate::commands::common::format_cursor_lines;
use crate::error::CliError;

pub async fn run_cursors(engine: &SyncEngine, user: &str, as_json: bool) -> Result<(), CliError> {
    let cursors = engine.list_cursors(user).await?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&cursors)?);
        return Ok(());
    }

    if cursors.is_empty() {
        println!("No devices registered for {user}.");
        return Ok(());
    }

    for line in format_cursor_lines(&cursors) {
        println!("{line}");
    }
    Ok(())
}

pub async fn run_retire_device(
    engine: &SyncEngine,
    user: &str,
    device: &str,
) -> Result<(), CliError> {
    engine.retire_device(user, device).await?;
    println!("Retired device {device} of {user}");
    Ok(())
}

pub async fn run_purge_devices(engine: &SyncEngine, older_than_days: u32) -> Result<(), CliError> {
    let cutoff = Utc::now() - Duration::days(i64::from(older_than_days));
    let purged = engine
        .purge_retired_devices(cutoff.timestamp_millis())
        .await?;
    println!("Purged {purged} retired device cursor(s)");
    Ok(())
}
