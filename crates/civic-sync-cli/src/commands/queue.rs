use civic_sync_core::sync::now_ms;
use civic_sync_core::SyncEngine;

use crate::commands::common::format_action_lines;
use crate::error::CliError;

pub async fn run_queue(
    engine: &SyncEngine,
    user: &str,
    device: &str,
    limit: usize,
    as_json: bool,
) -> Result<(), CliError> {
    let actions = engine.list_actions(user, device, limit).await?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&actions)?);
        return Ok(());
    }

    if actions.is_empty() {
        println!("No queued actions for {user}/{device}.");
        return Ok(());
    }

    for line in format_action_lines(&actions) {
        println!("{line}");
    }
    Ok(())
}

pub async fn run_drain(engine: &SyncEngine, limit: usize, as_json: bool) -> Result<(), CliError> {
    let report = engine.drain_due(now_ms(), limit).await?;
    tracing::debug!(processed = report.processed, "manual drain finished");

    if as_json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!(
            "Processed {}: {} applied, {} conflicted, {} failed, {} rescheduled, {} errors",
            report.processed,
            report.applied,
            report.conflicted,
            report.failed,
            report.rescheduled,
            report.errors
        );
    }
    Ok(())
}
