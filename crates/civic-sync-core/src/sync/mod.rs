//! Sync engine: offline action queue, conflict resolution, incremental download

mod authz;
mod download;
mod locks;
mod notify;
mod queue;
mod resolver;
mod session;

pub use authz::{AllowAll, Authorizer, EntityTypeAllowList, Visibility};
pub use download::{DownloadPage, PageToken};
pub use locks::{EntityGuard, EntityLocks};
pub use notify::{AppliedChange, BroadcastNotifier, ChangeNotifier, NoopNotifier};
pub use queue::{ActionQueue, DrainReport, Submission};
pub use resolver::{
    discarded_by_server_wins, ConflictResolver, FieldMergeResolver, Resolution, ResolverRegistry,
    StrategyPolicy,
};
pub use session::{SessionReport, SessionRequest, SessionState, SyncEngine, UploadReport};

/// Current time as unix milliseconds
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
