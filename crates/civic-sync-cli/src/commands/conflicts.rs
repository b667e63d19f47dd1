use civic_sync_core::models::{ConflictId, ManualResolution};
use civic_sync_core::SyncEngine;
use serde_json::Value;

use crate::commands::common::{conflict_to_item, format_conflict_lines, ConflictItem};
use crate::error::CliError;

pub async fn run_conflicts(
    engine: &SyncEngine,
    user: Option<&str>,
    device: Option<&str>,
    include_resolved: bool,
    as_json: bool,
) -> Result<(), CliError> {
    let conflicts = match (user, device) {
        (Some(user), Some(device)) => {
            let resolved = (!include_resolved).then_some(false);
            engine.list_conflicts(user, device, resolved).await?
        }
        _ => {
            let mut open = engine.list_unresolved_conflicts().await?;
            if let Some(user) = user {
                open.retain(|conflict| conflict.user_id == user);
            }
            open
        }
    };

    if as_json {
        let json_items = conflicts
            .iter()
            .map(conflict_to_item)
            .collect::<Vec<ConflictItem>>();
        println!("{}", serde_json::to_string_pretty(&json_items)?);
        return Ok(());
    }

    if conflicts.is_empty() {
        println!("No sync conflicts found.");
        return Ok(());
    }

    for line in format_conflict_lines(&conflicts) {
        println!("{line}");
    }
    Ok(())
}

pub async fn run_resolve(
    engine: &SyncEngine,
    id: &str,
    payload: Option<&str>,
    delete: bool,
    abandon: bool,
) -> Result<(), CliError> {
    let conflict_id: ConflictId = id
        .trim()
        .parse()
        .map_err(|_| CliError::InvalidConflictId(id.to_string()))?;
    let resolution = manual_resolution(payload, delete, abandon)?;

    let conflict = engine.queue().resolve_manual(&conflict_id, resolution).await?;
    println!(
        "Conflict {} on {}/{} resolved",
        conflict.id, conflict.entity_type, conflict.entity_id
    );
    Ok(())
}

pub fn manual_resolution(
    payload: Option<&str>,
    delete: bool,
    abandon: bool,
) -> Result<ManualResolution, CliError> {
    match (payload, delete, abandon) {
        (Some(raw), false, false) => {
            let value: Value = serde_json::from_str(raw)
                .map_err(|error| CliError::InvalidPayload(error.to_string()))?;
            if !value.is_object() {
                return Err(CliError::InvalidPayload(raw.to_string()));
            }
            Ok(ManualResolution::Apply {
                payload: Some(value),
            })
        }
        (None, true, false) => Ok(ManualResolution::Apply { payload: None }),
        (None, false, true) => Ok(ManualResolution::Abandon),
        _ => Err(CliError::MissingResolution),
    }
}
