//! Entity store record shapes

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A record as held by the entity store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub entity_type: String,
    pub entity_id: String,
    /// Store-wide monotonic version of the last write
    pub version: i64,
    /// `None` for tombstones
    pub payload: Option<Value>,
    pub deleted: bool,
    /// Last write timestamp (unix ms)
    pub updated_at: i64,
    /// Queued action that made the last write, if it came through the queue
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_action: Option<String>,
}

impl StoredRecord {
    /// Payload as seen by conflict resolution; tombstones read as JSON null
    pub fn payload_or_null(&self) -> Value {
        self.payload.clone().unwrap_or(Value::Null)
    }

    /// Whether the last write came from the queued action `action_id`
    pub fn written_by(&self, action_id: &str) -> bool {
        self.last_action.as_deref() == Some(action_id)
    }
}

/// One entry of an incremental download
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    pub entity_type: String,
    pub entity_id: String,
    pub version: i64,
    /// `None` when the record was deleted
    pub record: Option<Value>,
}

impl From<StoredRecord> for Change {
    fn from(record: StoredRecord) -> Self {
        Self {
            entity_type: record.entity_type,
            entity_id: record.entity_id,
            version: record.version,
            record: if record.deleted { None } else { record.payload },
        }
    }
}
