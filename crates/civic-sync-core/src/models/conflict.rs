//! Sync conflict model

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::ActionId;

/// Identifier of a recorded conflict, using UUID v7
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConflictId(Uuid);

impl ConflictId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    #[must_use]
    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for ConflictId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConflictId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ConflictId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// How a version conflict on an entity type is settled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    /// Keep the server's record, discard the client's change
    #[default]
    ServerWins,
    /// Overwrite the server's record with the client's payload
    ClientWins,
    /// Field-level merge; server wins fields touched by both sides
    Merge,
    /// Park the action until an external resolution arrives
    Manual,
}

impl ResolutionStrategy {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ServerWins => "server_wins",
            Self::ClientWins => "client_wins",
            Self::Merge => "merge",
            Self::Manual => "manual",
        }
    }
}

impl fmt::Display for ResolutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResolutionStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "server_wins" => Ok(Self::ServerWins),
            "client_wins" => Ok(Self::ClientWins),
            "merge" => Ok(Self::Merge),
            "manual" => Ok(Self::Manual),
            other => Err(Error::validation(format!(
                "unknown resolution strategy `{other}`"
            ))),
        }
    }
}

/// Recorded version divergence between a queued action and the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    pub id: ConflictId,
    pub action_id: ActionId,
    pub user_id: String,
    pub device_id: String,
    pub entity_type: String,
    pub entity_id: String,
    /// Baseline version the client edited against
    pub client_version: i64,
    /// Server version observed at apply time
    pub server_version: i64,
    /// Detection timestamp (unix ms)
    pub detected_at: i64,
    pub strategy_used: ResolutionStrategy,
    pub resolved: bool,
    pub resolved_at: Option<i64>,
    pub resolved_payload: Option<Value>,
    /// Client values dropped during resolution, kept for audit
    pub discarded_fields: Option<Value>,
}

/// Outcome supplied by an external party for a manual conflict
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManualResolution {
    /// Write `payload` (or delete the record when `None`) and mark the action applied
    Apply { payload: Option<Value> },
    /// Drop the client's change and mark the action abandoned
    Abandon,
}
