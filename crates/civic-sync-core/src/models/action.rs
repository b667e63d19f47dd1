//! Queued action model

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::ConflictId;

const MAX_IDENTIFIER_LEN: usize = 128;

/// Default retry budget for a queued action
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Server-side identifier of a queued action, using UUID v7 (time-sortable)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActionId(Uuid);

impl ActionId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    #[must_use]
    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for ActionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ActionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Kind of mutation a client queued offline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Create,
    Update,
    Delete,
}

impl ActionKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl FromStr for ActionKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "create" => Ok(Self::Create),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            other => Err(Error::Database(format!("unknown action kind `{other}`"))),
        }
    }
}

/// Lifecycle state of a queued action
///
/// Transitions only move forward:
/// `pending -> {applied, conflicted, failed}`, `conflicted -> {applied, abandoned}`,
/// `failed -> {pending, abandoned}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionOutcome {
    Pending,
    Applied,
    Conflicted,
    Failed,
    Abandoned,
}

impl ActionOutcome {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Applied => "applied",
            Self::Conflicted => "conflicted",
            Self::Failed => "failed",
            Self::Abandoned => "abandoned",
        }
    }

    /// Applied and abandoned actions are never touched again
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Applied | Self::Abandoned)
    }

    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Applied | Self::Conflicted | Self::Failed)
                | (Self::Conflicted, Self::Applied | Self::Abandoned)
                | (Self::Failed, Self::Pending | Self::Abandoned)
        )
    }
}

impl fmt::Display for ActionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionOutcome {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "applied" => Ok(Self::Applied),
            "conflicted" => Ok(Self::Conflicted),
            "failed" => Ok(Self::Failed),
            "abandoned" => Ok(Self::Abandoned),
            other => Err(Error::Database(format!("unknown action outcome `{other}`"))),
        }
    }
}

/// A mutation as submitted by a client in a batch upload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewAction {
    /// Client-generated idempotency key, unique per entity type
    #[serde(default)]
    pub client_entity_id: String,
    #[serde(default)]
    pub entity_type: String,
    pub action_kind: ActionKind,
    /// Target record; creates default to `client_entity_id`
    #[serde(default)]
    pub entity_id: Option<String>,
    #[serde(default)]
    pub payload: Option<Value>,
    /// Version the client believed current when it made the edit
    #[serde(default)]
    pub baseline_version: Option<i64>,
    /// Client's remembered copy of the record at `baseline_version`
    #[serde(default)]
    pub baseline_payload: Option<Value>,
    #[serde(default)]
    pub priority: i32,
}

impl NewAction {
    /// Check the action's shape before it is queued
    pub fn validate(&self) -> Result<()> {
        validate_identifier("client_entity_id", &self.client_entity_id)?;
        validate_identifier("entity_type", &self.entity_type)?;

        if let Some(entity_id) = &self.entity_id {
            validate_identifier("entity_id", entity_id)?;
        }

        match self.action_kind {
            ActionKind::Create | ActionKind::Update => {
                if !self.payload.as_ref().is_some_and(Value::is_object) {
                    return Err(Error::validation(format!(
                        "{} action requires a JSON object payload",
                        self.action_kind.as_str()
                    )));
                }
            }
            ActionKind::Delete => {}
        }

        if self.action_kind != ActionKind::Create && self.entity_id.is_none() {
            return Err(Error::validation(format!(
                "{} action requires entity_id",
                self.action_kind.as_str()
            )));
        }

        if self.baseline_version.is_some_and(|version| version < 0) {
            return Err(Error::validation("baseline_version must not be negative"));
        }

        Ok(())
    }

    /// Record this action targets
    pub fn target_entity_id(&self) -> &str {
        self.entity_id
            .as_deref()
            .unwrap_or(self.client_entity_id.as_str())
    }
}

/// Validate a client-supplied identifier: non-blank and bounded
pub fn validate_identifier(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::validation(format!("{field} is required")));
    }
    if value.len() > MAX_IDENTIFIER_LEN {
        return Err(Error::validation(format!(
            "{field} must be at most {MAX_IDENTIFIER_LEN} bytes"
        )));
    }
    Ok(())
}

/// A durable queue entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedAction {
    pub id: ActionId,
    pub user_id: String,
    pub device_id: String,
    pub client_entity_id: String,
    pub entity_type: String,
    pub entity_id: String,
    pub action_kind: ActionKind,
    pub payload: Option<Value>,
    pub baseline_version: Option<i64>,
    pub baseline_payload: Option<Value>,
    pub priority: i32,
    pub attempt_count: u32,
    pub max_attempts: u32,
    /// Enqueue timestamp (unix ms)
    pub enqueued_at: i64,
    /// Earliest time the action may be dequeued again (unix ms)
    pub next_attempt_at: i64,
    pub applied_at: Option<i64>,
    pub outcome: ActionOutcome,
    pub failure_reason: Option<String>,
    /// Whether a failed action may be revived by client resubmission
    pub retryable: bool,
    pub applied_version: Option<i64>,
    pub conflict_id: Option<ConflictId>,
}

impl QueuedAction {
    /// Build a fresh pending entry from a client submission
    pub fn from_new(user_id: &str, device_id: &str, action: NewAction, max_attempts: u32) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        let entity_id = action.target_entity_id().to_string();
        Self {
            id: ActionId::new(),
            user_id: user_id.to_string(),
            device_id: device_id.to_string(),
            client_entity_id: action.client_entity_id,
            entity_type: action.entity_type,
            entity_id,
            action_kind: action.action_kind,
            payload: action.payload,
            baseline_version: action.baseline_version,
            baseline_payload: action.baseline_payload,
            priority: action.priority,
            attempt_count: 0,
            max_attempts,
            enqueued_at: now,
            next_attempt_at: now,
            applied_at: None,
            outcome: ActionOutcome::Pending,
            failure_reason: None,
            retryable: false,
            applied_version: None,
            conflict_id: None,
        }
    }
}

/// Per-action status returned to the client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionResult {
    pub client_entity_id: String,
    pub entity_type: String,
    pub outcome: ActionOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conflict_id: Option<ConflictId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ActionResult {
    /// Result for an action rejected before it reached the queue
    pub fn rejected(action: &NewAction, error: &Error) -> Self {
        Self {
            client_entity_id: action.client_entity_id.clone(),
            entity_type: action.entity_type.clone(),
            outcome: ActionOutcome::Failed,
            server_id: None,
            conflict_id: None,
            version: None,
            error: Some(error.to_string()),
        }
    }
}

impl From<&QueuedAction> for ActionResult {
    fn from(action: &QueuedAction) -> Self {
        let server_id = matches!(action.outcome, ActionOutcome::Applied)
            .then(|| action.entity_id.clone());
        Self {
            client_entity_id: action.client_entity_id.clone(),
            entity_type: action.entity_type.clone(),
            outcome: action.outcome,
            server_id,
            conflict_id: action.conflict_id,
            version: action.applied_version,
            error: action.failure_reason.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn update(entity_id: Option<&str>) -> NewAction {
        NewAction {
            client_entity_id: "c1".to_string(),
            entity_type: "report".to_string(),
            action_kind: ActionKind::Update,
            entity_id: entity_id.map(str::to_string),
            payload: Some(json!({"severity": "high"})),
            baseline_version: Some(5),
            baseline_payload: None,
            priority: 0,
        }
    }

    #[test]
    fn test_outcome_transitions_only_forward() {
        use ActionOutcome::{Abandoned, Applied, Conflicted, Failed, Pending};

        assert!(Pending.can_transition_to(Applied));
        assert!(Pending.can_transition_to(Conflicted));
        assert!(Pending.can_transition_to(Failed));
        assert!(Conflicted.can_transition_to(Applied));
        assert!(Conflicted.can_transition_to(Abandoned));
        assert!(Failed.can_transition_to(Pending));
        assert!(Failed.can_transition_to(Abandoned));

        assert!(!Applied.can_transition_to(Pending));
        assert!(!Abandoned.can_transition_to(Applied));
        assert!(!Conflicted.can_transition_to(Pending));
        assert!(!Pending.can_transition_to(Abandoned));
    }

    #[test]
    fn test_outcome_parse_round_trip() {
        for outcome in [
            ActionOutcome::Pending,
            ActionOutcome::Applied,
            ActionOutcome::Conflicted,
            ActionOutcome::Failed,
            ActionOutcome::Abandoned,
        ] {
            assert_eq!(outcome.as_str().parse::<ActionOutcome>().unwrap(), outcome);
        }
        assert!("done".parse::<ActionOutcome>().is_err());
    }

    #[test]
    fn test_validate_requires_client_entity_id() {
        let mut action = update(Some("r-1"));
        action.client_entity_id = "  ".to_string();
        let err = action.validate().unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(err.to_string().contains("client_entity_id"));
    }

    #[test]
    fn test_validate_update_requires_entity_id() {
        let err = update(None).validate().unwrap_err();
        assert!(err.to_string().contains("entity_id"));
        assert!(update(Some("r-1")).validate().is_ok());
    }

    #[test]
    fn test_validate_payload_must_be_object() {
        let mut action = update(Some("r-1"));
        action.payload = Some(json!("high"));
        assert!(action.validate().is_err());

        action.action_kind = ActionKind::Delete;
        action.payload = None;
        assert!(action.validate().is_ok());
    }

    #[test]
    fn test_create_targets_client_entity_id_by_default() {
        let action = NewAction {
            action_kind: ActionKind::Create,
            entity_id: None,
            baseline_version: None,
            ..update(None)
        };
        assert!(action.validate().is_ok());
        assert_eq!(action.target_entity_id(), "c1");
    }

    #[test]
    fn test_new_action_deserializes_with_defaults() {
        let action: NewAction = serde_json::from_value(json!({
            "client_entity_id": "c1",
            "entity_type": "report",
            "action_kind": "update",
            "entity_id": "r-1",
            "payload": {"severity": "high"},
            "baseline_version": 5
        }))
        .unwrap();
        assert_eq!(action.priority, 0);
        assert_eq!(action.baseline_version, Some(5));
        assert!(action.baseline_payload.is_none());
    }

    #[test]
    fn test_missing_client_entity_id_deserializes_then_fails_validation() {
        let action: NewAction = serde_json::from_value(json!({
            "entity_type": "report",
            "action_kind": "create",
            "payload": {}
        }))
        .unwrap();
        assert!(matches!(action.validate(), Err(Error::Validation(_))));
    }
}
