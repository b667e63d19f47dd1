//! Device sync cursor model

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Per-device download marker, unique per (user, device)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSyncCursor {
    pub user_id: String,
    pub device_id: String,
    /// Highest server version fully downloaded by this device
    pub last_sync_version: i64,
    /// Last upload commit (unix ms)
    pub last_upload_at: Option<i64>,
    /// Last download commit (unix ms)
    pub last_download_at: Option<i64>,
    pub device_metadata: Option<Value>,
    /// First sync (unix ms)
    pub created_at: i64,
    /// Set when the device is retired; retired cursors may be purged
    pub retired_at: Option<i64>,
}

impl DeviceSyncCursor {
    pub const fn is_active(&self) -> bool {
        self.retired_at.is_none()
    }
}
