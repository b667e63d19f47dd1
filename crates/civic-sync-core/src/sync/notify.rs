//! Change notification seam
//!
//! Applied writes can be announced to interested parties (push gateways,
//! websocket fan-out). Delivery is best effort and never blocks a sync.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// A write the engine applied to the entity store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedChange {
    pub entity_type: String,
    pub entity_id: String,
    pub version: i64,
    /// Device whose action produced the write
    pub origin_device_id: String,
}

pub trait ChangeNotifier: Send + Sync {
    fn notify(&self, change: AppliedChange);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotifier;

impl ChangeNotifier for NoopNotifier {
    fn notify(&self, _change: AppliedChange) {}
}

/// Fans applied changes out over a tokio broadcast channel
#[derive(Debug, Clone)]
pub struct BroadcastNotifier {
    sender: broadcast::Sender<AppliedChange>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AppliedChange> {
        self.sender.subscribe()
    }
}

impl ChangeNotifier for BroadcastNotifier {
    fn notify(&self, change: AppliedChange) {
        // No subscribers is fine
        let _ = self.sender.send(change);
    }
}
