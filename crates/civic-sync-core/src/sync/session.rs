//! Sync session orchestration
//!
//! A full session walks START -> UPLOAD -> DOWNLOAD -> COMMIT -> DONE and
//! lands in FAILED if any step errors or the time budget runs out. Actions
//! applied before a failure stay applied; the cursor only moves at COMMIT.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::download::fetch_page;
use super::{
    now_ms, ActionQueue, AllowAll, Authorizer, ChangeNotifier, DownloadPage, DrainReport,
    EntityLocks, NoopNotifier, PageToken, ResolverRegistry, Submission,
};
use crate::config::SyncConfig;
use crate::db::{CursorRepository, Database};
use crate::error::{Error, Result};
use crate::models::{
    validate_identifier, ActionId, ActionOutcome, ActionResult, Change, Conflict, ConflictId,
    DeviceSyncCursor, ManualResolution, NewAction, QueuedAction,
};
use crate::store::{EntityStore, LibSqlEntityStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Start,
    Upload,
    Download,
    Commit,
    Done,
    Failed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Start => "START",
            Self::Upload => "UPLOAD",
            Self::Download => "DOWNLOAD",
            Self::Commit => "COMMIT",
            Self::Done => "DONE",
            Self::Failed => "FAILED",
        })
    }
}

/// One client sync call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRequest {
    pub user_id: String,
    pub device_id: String,
    #[serde(default)]
    pub device_metadata: Option<Value>,
    #[serde(default)]
    pub actions: Vec<NewAction>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionReport {
    pub state: SessionState,
    pub uploaded: usize,
    pub applied: usize,
    pub conflicted: usize,
    pub failed: usize,
    /// Accepted but left for the background worker
    pub pending: usize,
    pub downloaded: usize,
    pub new_cursor_version: i64,
    pub results: Vec<ActionResult>,
    pub changes: Vec<Change>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadReport {
    pub results: Vec<ActionResult>,
    pub cursor_version: i64,
}

/// Entry point for every sync operation
pub struct SyncEngine {
    db: Arc<Database>,
    queue: ActionQueue,
    config: Arc<SyncConfig>,
}

impl SyncEngine {
    pub fn new(db: Arc<Database>, store: Arc<dyn EntityStore>, config: SyncConfig) -> Self {
        let config = Arc::new(config);
        let queue = ActionQueue {
            db: Arc::clone(&db),
            store,
            authorizer: Arc::new(AllowAll),
            notifier: Arc::new(NoopNotifier),
            resolvers: ResolverRegistry::default(),
            locks: EntityLocks::new(),
            config: Arc::clone(&config),
        };
        Self { db, queue, config }
    }

    /// Engine whose entity store lives in the sync database itself
    pub fn local(db: Arc<Database>, config: SyncConfig) -> Self {
        let store = Arc::new(LibSqlEntityStore::new(Arc::clone(&db)));
        Self::new(db, store, config)
    }

    #[must_use]
    pub fn with_authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.queue.authorizer = authorizer;
        self
    }

    #[must_use]
    pub fn with_notifier(mut self, notifier: Arc<dyn ChangeNotifier>) -> Self {
        self.queue.notifier = notifier;
        self
    }

    #[must_use]
    pub fn with_resolvers(mut self, resolvers: ResolverRegistry) -> Self {
        self.queue.resolvers = resolvers;
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub const fn queue(&self) -> &ActionQueue {
        &self.queue
    }

    pub fn store(&self) -> &dyn EntityStore {
        self.queue.store.as_ref()
    }

    fn cursors(&self) -> CursorRepository<'_> {
        CursorRepository::new(self.db.connection())
    }

    /// Full session: upload the batch, download everything newer than the
    /// device's cursor, then commit the cursor
    pub async fn run_session(&self, request: SessionRequest) -> Result<SessionReport> {
        let user_id = request.user_id.clone();
        let device_id = request.device_id.clone();
        let state = Mutex::new(SessionState::Start);

        let result = self
            .within_budget(self.session_steps(request, &state))
            .await;

        let reached = *state.lock().unwrap_or_else(PoisonError::into_inner);
        match &result {
            Ok(report) => tracing::info!(
                user = %user_id,
                device = %device_id,
                applied = report.applied,
                conflicted = report.conflicted,
                failed = report.failed,
                downloaded = report.downloaded,
                cursor = report.new_cursor_version,
                "sync session done"
            ),
            Err(error) => tracing::warn!(
                user = %user_id,
                device = %device_id,
                state = %reached,
                %error,
                "sync session failed"
            ),
        }
        result
    }

    async fn session_steps(
        &self,
        request: SessionRequest,
        state: &Mutex<SessionState>,
    ) -> Result<SessionReport> {
        let SessionRequest {
            user_id,
            device_id,
            device_metadata,
            actions,
        } = request;

        let cursor = self
            .start(&user_id, &device_id, device_metadata.as_ref())
            .await?;

        enter(state, SessionState::Upload, &user_id, &device_id);
        let uploaded = actions.len();
        let results = self.upload(&user_id, &device_id, actions).await?;
        let uploaded_at = (uploaded > 0).then(now_ms);

        enter(state, SessionState::Download, &user_id, &device_id);
        let visibility = self.queue.authorizer.visibility(&user_id).await;
        let mut after_version = cursor.last_sync_version;
        let mut changes = Vec::new();
        loop {
            let (page, has_more) = fetch_page(
                self.store(),
                after_version,
                &visibility,
                self.config.download_page_size,
            )
            .await?;
            if let Some(last) = page.last() {
                after_version = last.version;
            }
            changes.extend(page);
            if !has_more {
                break;
            }
        }

        enter(state, SessionState::Commit, &user_id, &device_id);
        let committed = self
            .cursors()
            .commit(&user_id, &device_id, after_version, uploaded_at, Some(now_ms()))
            .await?;

        enter(state, SessionState::Done, &user_id, &device_id);
        let count =
            |outcome: ActionOutcome| results.iter().filter(|r| r.outcome == outcome).count();
        Ok(SessionReport {
            state: SessionState::Done,
            uploaded,
            applied: count(ActionOutcome::Applied),
            conflicted: count(ActionOutcome::Conflicted),
            failed: count(ActionOutcome::Failed),
            pending: count(ActionOutcome::Pending),
            downloaded: changes.len(),
            new_cursor_version: committed.last_sync_version,
            results,
            changes,
        })
    }

    /// Enqueue and apply a batch without touching the download cursor
    pub async fn batch_upload(
        &self,
        user_id: &str,
        device_id: &str,
        actions: Vec<NewAction>,
    ) -> Result<UploadReport> {
        self.within_budget(async {
            let cursor = self.start(user_id, device_id, None).await?;
            let uploaded = !actions.is_empty();
            let results = self.upload(user_id, device_id, actions).await?;
            let cursor = if uploaded {
                self.cursors()
                    .commit(
                        user_id,
                        device_id,
                        cursor.last_sync_version,
                        Some(now_ms()),
                        None,
                    )
                    .await?
            } else {
                cursor
            };
            Ok(UploadReport {
                results,
                cursor_version: cursor.last_sync_version,
            })
        })
        .await
    }

    /// One page of changes; the final page commits the device cursor
    ///
    /// Paging starts from `page_token` if given, else `since_version`, else
    /// the device's stored cursor.
    pub async fn download_page(
        &self,
        user_id: &str,
        device_id: &str,
        since_version: Option<i64>,
        page_token: Option<&str>,
    ) -> Result<DownloadPage> {
        self.within_budget(async {
            let cursor = self.start(user_id, device_id, None).await?;

            let after_version = match (page_token, since_version) {
                (Some(token), _) => PageToken::decode(token)?.after_version,
                (None, Some(version)) if version < 0 => {
                    return Err(Error::validation("since_version must not be negative"));
                }
                (None, Some(version)) => version,
                (None, None) => cursor.last_sync_version,
            };

            let visibility = self.queue.authorizer.visibility(user_id).await;
            let (changes, has_more) = fetch_page(
                self.store(),
                after_version,
                &visibility,
                self.config.download_page_size,
            )
            .await?;
            let last_version = changes.last().map_or(after_version, |c| c.version);

            if has_more {
                return Ok(DownloadPage {
                    changes,
                    next_page_token: Some(
                        PageToken {
                            after_version: last_version,
                        }
                        .encode(),
                    ),
                    cursor_version: cursor.last_sync_version,
                });
            }

            // A client-supplied starting point can never push the cursor past
            // what the store has issued
            let observed = last_version.min(self.store().current_version().await?);
            let committed = self
                .cursors()
                .commit(user_id, device_id, observed, None, Some(now_ms()))
                .await?;
            tracing::debug!(
                user = user_id,
                device = device_id,
                cursor = committed.last_sync_version,
                "download complete, cursor committed"
            );

            Ok(DownloadPage {
                changes,
                next_page_token: None,
                cursor_version: committed.last_sync_version,
            })
        })
        .await
    }

    /// Conflicts raised by a device's actions
    pub async fn list_conflicts(
        &self,
        user_id: &str,
        device_id: &str,
        resolved: Option<bool>,
    ) -> Result<Vec<Conflict>> {
        validate_identifier("user_id", user_id)?;
        validate_identifier("device_id", device_id)?;
        self.queue
            .conflicts()
            .list_for_device(user_id, device_id, resolved)
            .await
    }

    /// Every open conflict across users
    pub async fn list_unresolved_conflicts(&self) -> Result<Vec<Conflict>> {
        self.queue.conflicts().list_unresolved().await
    }

    /// Resolve a manual conflict on behalf of the user whose action raised it
    pub async fn resolve_conflict(
        &self,
        user_id: &str,
        conflict_id: &ConflictId,
        resolution: ManualResolution,
    ) -> Result<Conflict> {
        let conflict = self.queue.load_conflict(conflict_id).await?;
        if conflict.user_id != user_id {
            return Err(Error::not_found(format!("conflict {conflict_id}")));
        }
        self.queue.resolve_manual(conflict_id, resolution).await
    }

    pub async fn list_actions(
        &self,
        user_id: &str,
        device_id: &str,
        limit: usize,
    ) -> Result<Vec<QueuedAction>> {
        self.queue
            .actions()
            .list_for_device(user_id, device_id, limit)
            .await
    }

    pub async fn pending_count(&self) -> Result<u64> {
        self.queue.actions().pending_count().await
    }

    /// Background pass over due actions
    pub async fn drain_due(&self, now: i64, limit: usize) -> Result<DrainReport> {
        self.queue.drain_due(now, limit).await
    }

    pub async fn list_cursors(&self, user_id: &str) -> Result<Vec<DeviceSyncCursor>> {
        self.cursors().list_for_user(user_id).await
    }

    pub async fn retire_device(&self, user_id: &str, device_id: &str) -> Result<()> {
        self.cursors().retire(user_id, device_id).await?;
        tracing::info!(user = user_id, device = device_id, "device retired");
        Ok(())
    }

    pub async fn purge_retired_devices(&self, retired_before: i64) -> Result<u64> {
        self.cursors().purge_retired(retired_before).await
    }

    async fn start(
        &self,
        user_id: &str,
        device_id: &str,
        device_metadata: Option<&Value>,
    ) -> Result<DeviceSyncCursor> {
        validate_identifier("user_id", user_id)?;
        validate_identifier("device_id", device_id)?;
        self.cursors()
            .load_or_create(user_id, device_id, device_metadata)
            .await
    }

    async fn upload(
        &self,
        user_id: &str,
        device_id: &str,
        actions: Vec<NewAction>,
    ) -> Result<Vec<ActionResult>> {
        if actions.is_empty() {
            return Ok(Vec::new());
        }

        let submissions = self.queue.enqueue(user_id, device_id, actions).await?;
        let pending: Vec<ActionId> = submissions
            .iter()
            .filter_map(Submission::pending_id)
            .collect();
        let drained = self
            .queue
            .drain_ids(&pending, now_ms(), self.config.upload_batch_size)
            .await?;
        tracing::debug!(
            user = user_id,
            device = device_id,
            submitted = submissions.len(),
            processed = drained.processed,
            "upload drained"
        );

        let mut results = Vec::with_capacity(submissions.len());
        for submission in submissions {
            let result = match submission {
                Submission::Rejected(result) => result,
                Submission::Queued(action) | Submission::Existing(action) => {
                    let current = self
                        .queue
                        .actions()
                        .get(&action.id)
                        .await?
                        .unwrap_or(action);
                    ActionResult::from(&current)
                }
            };
            results.push(result);
        }
        Ok(results)
    }

    async fn within_budget<T>(&self, work: impl Future<Output = Result<T>>) -> Result<T> {
        let budget = self.config.session_timeout;
        tokio::time::timeout(budget, work)
            .await
            .unwrap_or_else(|_| Err(Error::SessionTimeout(budget)))
    }
}

fn enter(state: &Mutex<SessionState>, next: SessionState, user_id: &str, device_id: &str) {
    *state.lock().unwrap_or_else(PoisonError::into_inner) = next;
    tracing::debug!(user = user_id, device = device_id, state = %next, "sync session transition");
}
