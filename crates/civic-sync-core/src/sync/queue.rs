//! Offline action queue processing
//!
//! Enqueue is idempotent on (entity_type, client_entity_id). Processing takes
//! the per-entity lock, re-reads the action, and applies it against the
//! entity store with optimistic concurrency. Version divergence is settled by
//! the entity type's resolution strategy.

use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Value};

use super::resolver::discarded_by_server_wins;
use super::{
    now_ms, AppliedChange, Authorizer, ChangeNotifier, EntityLocks, ResolverRegistry,
};
use crate::config::SyncConfig;
use crate::db::{ConflictRepository, Database, EnqueueOutcome, QueueRepository};
use crate::error::{Error, Result};
use crate::models::{
    ActionId, ActionKind, ActionOutcome, ActionResult, Conflict, ConflictId, ManualResolution,
    NewAction, QueuedAction, ResolutionStrategy, StoredRecord,
};
use crate::store::{EntityStore, StoreError};

/// CAS attempts against writers outside the engine before giving up for now
const MAX_CAS_ROUNDS: usize = 3;

/// What enqueue did with one submitted action
#[derive(Debug, Clone, PartialEq)]
pub enum Submission {
    /// New, or a revived retryable failure; pending
    Queued(QueuedAction),
    /// Already known; its prior outcome stands
    Existing(QueuedAction),
    /// Never stored
    Rejected(ActionResult),
}

impl Submission {
    /// Pending action this submission can drive
    pub fn pending_id(&self) -> Option<ActionId> {
        match self {
            Self::Queued(action) | Self::Existing(action)
                if action.outcome == ActionOutcome::Pending =>
            {
                Some(action.id)
            }
            _ => None,
        }
    }
}

/// Counters for one drain pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub processed: usize,
    pub applied: usize,
    pub conflicted: usize,
    pub failed: usize,
    /// Still pending after a transient failure
    pub rescheduled: usize,
    /// Actions whose processing hit an infrastructure error
    pub errors: usize,
}

impl DrainReport {
    fn record(&mut self, action: &QueuedAction) {
        self.processed += 1;
        match action.outcome {
            ActionOutcome::Applied => self.applied += 1,
            ActionOutcome::Conflicted => self.conflicted += 1,
            ActionOutcome::Failed => self.failed += 1,
            ActionOutcome::Pending => self.rescheduled += 1,
            ActionOutcome::Abandoned => {}
        }
    }
}

enum Applied {
    Done {
        version: Option<i64>,
        written: bool,
        conflict_id: Option<ConflictId>,
    },
    Conflicted(ConflictId),
    Rejected(String),
}

impl Applied {
    const fn write(version: i64, conflict_id: Option<ConflictId>) -> Self {
        Self::Done {
            version: Some(version),
            written: true,
            conflict_id,
        }
    }
}

pub struct ActionQueue {
    pub(super) db: Arc<Database>,
    pub(super) store: Arc<dyn EntityStore>,
    pub(super) authorizer: Arc<dyn Authorizer>,
    pub(super) notifier: Arc<dyn ChangeNotifier>,
    pub(super) resolvers: ResolverRegistry,
    pub(super) locks: EntityLocks,
    pub(super) config: Arc<SyncConfig>,
}

impl ActionQueue {
    pub(super) fn actions(&self) -> QueueRepository<'_> {
        QueueRepository::new(self.db.connection())
    }

    pub(super) fn conflicts(&self) -> ConflictRepository<'_> {
        ConflictRepository::new(self.db.connection())
    }

    /// Validate, authorize, and durably record a batch; results keep batch order
    pub async fn enqueue(
        &self,
        user_id: &str,
        device_id: &str,
        actions: Vec<NewAction>,
    ) -> Result<Vec<Submission>> {
        let mut submissions = Vec::with_capacity(actions.len());

        for action in actions {
            if let Err(error) = action.validate() {
                tracing::debug!(
                    user = user_id,
                    device = device_id,
                    client_entity_id = %action.client_entity_id,
                    %error,
                    "rejected invalid action"
                );
                submissions.push(Submission::Rejected(ActionResult::rejected(&action, &error)));
                continue;
            }

            if !self.authorizer.can_write(user_id, &action.entity_type).await {
                let error = Error::AuthorizationDenied(format!(
                    "user may not write entity type {}",
                    action.entity_type
                ));
                submissions.push(Submission::Rejected(ActionResult::rejected(&action, &error)));
                continue;
            }

            let queued =
                QueuedAction::from_new(user_id, device_id, action, self.config.max_attempts);
            let submission = match self.actions().insert_or_get(&queued).await? {
                EnqueueOutcome::Inserted(action) => Submission::Queued(action),
                EnqueueOutcome::Existing(existing) => {
                    self.resubmitted(existing, user_id, device_id).await?
                }
            };
            submissions.push(submission);
        }

        Ok(submissions)
    }

    async fn resubmitted(
        &self,
        existing: QueuedAction,
        user_id: &str,
        device_id: &str,
    ) -> Result<Submission> {
        if existing.user_id != user_id || existing.device_id != device_id {
            let error = Error::UniquenessViolation(format!(
                "client_entity_id {} is already used for {}",
                existing.client_entity_id, existing.entity_type
            ));
            return Ok(Submission::Rejected(ActionResult {
                client_entity_id: existing.client_entity_id,
                entity_type: existing.entity_type,
                outcome: ActionOutcome::Failed,
                server_id: None,
                conflict_id: None,
                version: None,
                error: Some(error.to_string()),
            }));
        }

        if existing.outcome == ActionOutcome::Failed
            && existing.retryable
            && self.actions().revive(&existing.id, now_ms()).await?
        {
            tracing::info!(
                action = %existing.id,
                client_entity_id = %existing.client_entity_id,
                "resubmitted action revived"
            );
            let revived = self.actions().get(&existing.id).await?.unwrap_or(existing);
            return Ok(Submission::Queued(revived));
        }

        Ok(Submission::Existing(existing))
    }

    /// Process due pending actions from `ids`, at most `limit`
    pub async fn drain_ids(&self, ids: &[ActionId], now: i64, limit: usize) -> Result<DrainReport> {
        let due = self.actions().due_among(ids, now, limit).await?;
        let mut report = DrainReport::default();
        for action in due {
            let processed = self.process(&action.id, now).await?;
            report.record(&processed);
        }
        Ok(report)
    }

    /// Process any due pending actions, at most `limit`
    ///
    /// Infrastructure errors on one action are logged and counted; the pass
    /// moves on to the next action.
    pub async fn drain_due(&self, now: i64, limit: usize) -> Result<DrainReport> {
        let due = self.actions().due(now, limit).await?;
        let mut report = DrainReport::default();
        for action in due {
            match self.process(&action.id, now).await {
                Ok(processed) => report.record(&processed),
                Err(error) => {
                    tracing::error!(action = %action.id, %error, "queued action processing failed");
                    report.errors += 1;
                }
            }
        }
        Ok(report)
    }

    /// Apply one action under its entity lock; returns the action's new state
    pub async fn process(&self, id: &ActionId, now: i64) -> Result<QueuedAction> {
        let action = self
            .actions()
            .get(id)
            .await?
            .ok_or_else(|| Error::not_found(format!("queued action {id}")))?;

        let _guard = self.locks.lock(&action.entity_type, &action.entity_id).await;

        // Another session or worker may have finished it while we waited
        let action = self
            .actions()
            .get(id)
            .await?
            .ok_or_else(|| Error::not_found(format!("queued action {id}")))?;
        if action.outcome != ActionOutcome::Pending {
            return Ok(action);
        }

        let attempt = action.attempt_count + 1;
        match self.apply(&action).await {
            Ok(Applied::Done {
                version,
                written,
                conflict_id,
            }) => {
                self.actions()
                    .mark_applied(id, ActionOutcome::Pending, version, conflict_id)
                    .await?;
                if let (true, Some(version)) = (written, version) {
                    self.announce(&action, version);
                }
                tracing::info!(
                    action = %id,
                    entity_type = %action.entity_type,
                    entity_id = %action.entity_id,
                    outcome = "applied",
                    ?version,
                    "queued action applied"
                );
            }
            Ok(Applied::Conflicted(conflict_id)) => {
                self.actions().mark_conflicted(id, &conflict_id).await?;
                tracing::info!(
                    action = %id,
                    entity_type = %action.entity_type,
                    entity_id = %action.entity_id,
                    conflict = %conflict_id,
                    outcome = "conflicted",
                    "queued action awaits manual resolution"
                );
            }
            Ok(Applied::Rejected(reason)) => {
                self.actions().mark_failed(id, attempt, &reason, false).await?;
                tracing::warn!(
                    action = %id,
                    entity_type = %action.entity_type,
                    outcome = "failed",
                    %reason,
                    "queued action rejected"
                );
            }
            Err(Error::Store(error)) if error.is_transient() => {
                let reason = error.to_string();
                if attempt < action.max_attempts {
                    let delay = self.config.backoff(attempt);
                    let delay_ms = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
                    self.actions()
                        .reschedule(id, attempt, now.saturating_add(delay_ms), &reason)
                        .await?;
                    tracing::warn!(
                        action = %id,
                        attempt,
                        retry_in_ms = delay_ms,
                        %reason,
                        "transient store failure, retry scheduled"
                    );
                } else {
                    self.actions().mark_failed(id, attempt, &reason, true).await?;
                    tracing::warn!(
                        action = %id,
                        attempt,
                        outcome = "failed",
                        %reason,
                        "retries exhausted, awaiting client resubmission"
                    );
                }
            }
            Err(Error::Store(error)) => {
                self.actions()
                    .mark_failed(id, attempt, &error.to_string(), false)
                    .await?;
                tracing::warn!(action = %id, outcome = "failed", %error, "entity store rejected action");
            }
            Err(error) => return Err(error),
        }

        self.actions()
            .get(id)
            .await?
            .ok_or_else(|| Error::not_found(format!("queued action {id}")))
    }

    async fn apply(&self, action: &QueuedAction) -> Result<Applied> {
        if action.action_kind == ActionKind::Create {
            return self.apply_create(action).await;
        }

        let origin = action.id.to_string();
        for _ in 0..MAX_CAS_ROUNDS {
            let record = match self.store.get(&action.entity_type, &action.entity_id).await? {
                // An earlier attempt landed its write but never recorded the outcome
                Some(record) if record.written_by(&origin) => {
                    tracing::info!(
                        action = %action.id,
                        entity_id = %action.entity_id,
                        version = record.version,
                        "write from an interrupted attempt found, marking applied"
                    );
                    return Ok(Applied::write(record.version, None));
                }
                Some(record) if !record.deleted => record,
                Some(tombstone) if action.action_kind == ActionKind::Delete => {
                    return Ok(Applied::Done {
                        version: Some(tombstone.version),
                        written: false,
                        conflict_id: None,
                    });
                }
                _ => {
                    return Ok(Applied::Rejected(format!(
                        "Not found: {} {}",
                        action.entity_type, action.entity_id
                    )));
                }
            };

            let attempt = match action.baseline_version {
                Some(baseline) if baseline > record.version => {
                    return Ok(Applied::Rejected(format!(
                        "Validation error: baseline_version {baseline} is ahead of server version {}",
                        record.version
                    )));
                }
                Some(baseline) if baseline < record.version => {
                    self.resolve_divergence(action, baseline, &record).await?
                }
                _ => self
                    .write_client(action, record.version)
                    .await?
                    .map(|version| Applied::write(version, None)),
            };

            if let Some(applied) = attempt {
                return Ok(applied);
            }
            tracing::debug!(
                action = %action.id,
                entity_id = %action.entity_id,
                "record moved during apply, re-reading"
            );
        }

        Err(StoreError::Transient(format!(
            "{} {} kept changing during apply",
            action.entity_type, action.entity_id
        ))
        .into())
    }

    async fn apply_create(&self, action: &QueuedAction) -> Result<Applied> {
        let payload = action.payload.clone().unwrap_or_else(|| json!({}));
        let origin = action.id.to_string();
        match self
            .store
            .create_as(&action.entity_type, &action.entity_id, &payload, Some(&origin))
            .await
        {
            Ok(version) => Ok(Applied::write(version, None)),
            Err(StoreError::AlreadyExists(entity)) => {
                match self.store.get(&action.entity_type, &action.entity_id).await? {
                    Some(record) if record.written_by(&origin) => {
                        tracing::info!(
                            action = %action.id,
                            entity_id = %action.entity_id,
                            version = record.version,
                            "create from an interrupted attempt found, marking applied"
                        );
                        Ok(Applied::write(record.version, None))
                    }
                    _ => Ok(Applied::Rejected(
                        Error::UniquenessViolation(format!("entity {entity} already exists"))
                            .to_string(),
                    )),
                }
            }
            Err(error) => Err(error.into()),
        }
    }

    /// CAS-write the client's change; `None` when the version moved underneath
    async fn write_client(&self, action: &QueuedAction, expected: i64) -> Result<Option<i64>> {
        let origin = action.id.to_string();
        let result = match (&action.action_kind, &action.payload) {
            (ActionKind::Delete, _) => {
                self.store
                    .delete_as(&action.entity_type, &action.entity_id, expected, Some(&origin))
                    .await
            }
            (_, Some(payload)) => {
                self.store
                    .put_as(
                        &action.entity_type,
                        &action.entity_id,
                        payload,
                        expected,
                        Some(&origin),
                    )
                    .await
            }
            (_, None) => Err(StoreError::Permanent("update action has no payload".to_string())),
        };

        match result {
            Ok(version) => Ok(Some(version)),
            Err(StoreError::VersionMismatch { .. } | StoreError::NotFound(_)) => Ok(None),
            Err(error) => Err(error.into()),
        }
    }

    /// Settle a stale baseline with the entity type's strategy
    ///
    /// `None` means the record moved again and detection must re-run.
    async fn resolve_divergence(
        &self,
        action: &QueuedAction,
        baseline: i64,
        record: &StoredRecord,
    ) -> Result<Option<Applied>> {
        let strategy = self.config.strategies.strategy_for(&action.entity_type);
        let mut conflict = Conflict {
            id: ConflictId::new(),
            action_id: action.id,
            user_id: action.user_id.clone(),
            device_id: action.device_id.clone(),
            entity_type: action.entity_type.clone(),
            entity_id: action.entity_id.clone(),
            client_version: baseline,
            server_version: record.version,
            detected_at: now_ms(),
            strategy_used: strategy,
            resolved: false,
            resolved_at: None,
            resolved_payload: None,
            discarded_fields: None,
        };
        let server_payload = record.payload_or_null();

        tracing::info!(
            action = %action.id,
            entity_type = %action.entity_type,
            entity_id = %action.entity_id,
            client_version = baseline,
            server_version = record.version,
            strategy = %strategy,
            "version conflict detected"
        );

        // A delete cannot be merged field by field; the server record stays
        let effective = match (strategy, action.action_kind) {
            (ResolutionStrategy::Merge, ActionKind::Delete) => ResolutionStrategy::ServerWins,
            (strategy, _) => strategy,
        };

        let applied = match effective {
            ResolutionStrategy::ServerWins => {
                let baseline_payload = self.client_baseline(action, baseline).await?;
                let discarded = discarded_by_server_wins(
                    action.payload.as_ref(),
                    &baseline_payload,
                    &server_payload,
                );
                conflict.discarded_fields =
                    (!discarded.is_empty()).then_some(Value::Object(discarded));
                close(&mut conflict, Some(server_payload));
                Applied::Done {
                    version: Some(record.version),
                    written: false,
                    conflict_id: Some(conflict.id),
                }
            }
            ResolutionStrategy::ClientWins => {
                let Some(version) = self.write_client(action, record.version).await? else {
                    return Ok(None);
                };
                close(&mut conflict, Some(action.payload.clone().unwrap_or(Value::Null)));
                Applied::write(version, Some(conflict.id))
            }
            ResolutionStrategy::Merge => {
                let client_payload = action.payload.clone().unwrap_or_else(|| json!({}));
                let baseline_payload = self.client_baseline(action, baseline).await?;
                let resolution = self
                    .resolvers
                    .resolver_for(&action.entity_type)
                    .resolve(&client_payload, &baseline_payload, &server_payload);

                let origin = action.id.to_string();
                let version = match self
                    .store
                    .put_as(
                        &action.entity_type,
                        &action.entity_id,
                        &resolution.payload,
                        record.version,
                        Some(&origin),
                    )
                    .await
                {
                    Ok(version) => version,
                    Err(StoreError::VersionMismatch { .. } | StoreError::NotFound(_)) => {
                        return Ok(None)
                    }
                    Err(error) => return Err(error.into()),
                };
                conflict.discarded_fields = resolution.discarded_value();
                close(&mut conflict, Some(resolution.payload));
                Applied::write(version, Some(conflict.id))
            }
            ResolutionStrategy::Manual => Applied::Conflicted(conflict.id),
        };

        self.conflicts().insert(&conflict).await?;
        Ok(Some(applied))
    }

    /// The record as the client last saw it
    async fn client_baseline(&self, action: &QueuedAction, baseline: i64) -> Result<Value> {
        if let Some(payload) = &action.baseline_payload {
            return Ok(payload.clone());
        }
        let snapshot = self
            .store
            .snapshot_at(&action.entity_type, &action.entity_id, baseline)
            .await?;
        Ok(snapshot.unwrap_or_else(|| json!({})))
    }

    /// Close a manual conflict with an externally chosen outcome
    pub async fn resolve_manual(
        &self,
        conflict_id: &ConflictId,
        resolution: ManualResolution,
    ) -> Result<Conflict> {
        let conflict = self.load_conflict(conflict_id).await?;
        let _guard = self
            .locks
            .lock(&conflict.entity_type, &conflict.entity_id)
            .await;

        // Re-read under the lock: a concurrent resolution may have won
        let conflict = self.load_conflict(conflict_id).await?;
        if conflict.resolved {
            return Ok(conflict);
        }

        let action = self
            .actions()
            .get(&conflict.action_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("queued action {}", conflict.action_id)))?;
        if action.outcome != ActionOutcome::Conflicted {
            return Err(Error::validation(format!(
                "action {} is {}, not awaiting resolution",
                action.id, action.outcome
            )));
        }

        match resolution {
            ManualResolution::Abandon => {
                self.actions()
                    .mark_abandoned(&action.id, ActionOutcome::Conflicted)
                    .await?;
                self.conflicts()
                    .mark_resolved(conflict_id, None, action.payload.as_ref())
                    .await?;
                tracing::info!(conflict = %conflict_id, action = %action.id, "conflict abandoned");
            }
            ManualResolution::Apply { payload } => {
                let origin = action.id.to_string();
                let result = match &payload {
                    Some(payload) if payload.is_object() => {
                        self.store
                            .put_as(
                                &conflict.entity_type,
                                &conflict.entity_id,
                                payload,
                                conflict.server_version,
                                Some(&origin),
                            )
                            .await
                    }
                    Some(_) => {
                        return Err(Error::validation("resolved_payload must be a JSON object"))
                    }
                    None if action.action_kind == ActionKind::Delete => {
                        self.store
                            .delete_as(
                                &conflict.entity_type,
                                &conflict.entity_id,
                                conflict.server_version,
                                Some(&origin),
                            )
                            .await
                    }
                    None => return Err(Error::validation("resolved_payload is required")),
                };

                let version = match result {
                    Ok(version) => version,
                    Err(StoreError::VersionMismatch { current }) => {
                        return Err(self.stale(conflict_id, current).await?);
                    }
                    Err(StoreError::NotFound(entity)) => {
                        let current = self
                            .store
                            .get(&conflict.entity_type, &conflict.entity_id)
                            .await?
                            .ok_or_else(|| Error::not_found(entity))?
                            .version;
                        return Err(self.stale(conflict_id, current).await?);
                    }
                    Err(error) => return Err(error.into()),
                };

                self.actions()
                    .mark_applied(
                        &action.id,
                        ActionOutcome::Conflicted,
                        Some(version),
                        Some(*conflict_id),
                    )
                    .await?;
                self.conflicts()
                    .mark_resolved(conflict_id, payload.as_ref(), None)
                    .await?;
                self.announce(&action, version);
                tracing::info!(
                    conflict = %conflict_id,
                    action = %action.id,
                    version,
                    "manual resolution applied"
                );
            }
        }

        self.load_conflict(conflict_id).await
    }

    /// Record the newer server version and build the error the caller retries on
    async fn stale(&self, conflict_id: &ConflictId, current: i64) -> Result<Error> {
        self.conflicts()
            .refresh_server_version(conflict_id, current)
            .await?;
        tracing::info!(conflict = %conflict_id, server_version = current, "manual resolution is stale");
        Ok(Error::StaleResolution {
            conflict_id: conflict_id.to_string(),
            server_version: current,
        })
    }

    pub(super) async fn load_conflict(&self, conflict_id: &ConflictId) -> Result<Conflict> {
        self.conflicts()
            .get(conflict_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("conflict {conflict_id}")))
    }

    fn announce(&self, action: &QueuedAction, version: i64) {
        self.notifier.notify(AppliedChange {
            entity_type: action.entity_type.clone(),
            entity_id: action.entity_id.clone(),
            version,
            origin_device_id: action.device_id.clone(),
        });
    }
}

fn close(conflict: &mut Conflict, resolved_payload: Option<Value>) {
    conflict.resolved = true;
    conflict.resolved_at = Some(now_ms());
    conflict.resolved_payload = resolved_payload;
}
