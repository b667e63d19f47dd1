//! Offline action queue persistence

#![allow(clippy::cast_possible_wrap)] // SQLite uses i64 for LIMIT

use libsql::params::Params;
use libsql::{params, Connection, Row, Value};

use super::rows::to_u32;
use super::{json_value, opt_int, opt_text, parse_json};
use crate::error::{Error, Result};
use crate::models::{ActionId, ActionOutcome, ConflictId, QueuedAction};

const ACTION_COLUMNS: &str = "id, user_id, device_id, client_entity_id, entity_type, entity_id, \
     action_kind, payload, baseline_version, baseline_payload, priority, attempt_count, \
     max_attempts, enqueued_at, next_attempt_at, applied_at, outcome, failure_reason, \
     retryable, applied_version, conflict_id";

/// Dequeue order: priority descending, then oldest first
const DEQUEUE_ORDER: &str = "ORDER BY priority DESC, enqueued_at ASC, id ASC";

/// Result of inserting a queue entry keyed by (entity_type, client_entity_id)
#[derive(Debug, Clone, PartialEq)]
pub enum EnqueueOutcome {
    /// The action was new and is now pending
    Inserted(QueuedAction),
    /// An entry with the same key already existed; it was left untouched
    Existing(QueuedAction),
}

/// Repository for queued client mutations
pub struct QueueRepository<'a> {
    conn: &'a Connection,
}

impl<'a> QueueRepository<'a> {
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Insert a new pending action unless its idempotency key is already taken
    pub async fn insert_or_get(&self, action: &QueuedAction) -> Result<EnqueueOutcome> {
        let inserted = self
            .conn
            .execute(
                "INSERT INTO queued_actions (
                    id, user_id, device_id, client_entity_id, entity_type, entity_id,
                    action_kind, payload, baseline_version, baseline_payload, priority,
                    attempt_count, max_attempts, enqueued_at, next_attempt_at, outcome
                 ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(entity_type, client_entity_id) DO NOTHING",
                params![
                    action.id.as_str(),
                    action.user_id.as_str(),
                    action.device_id.as_str(),
                    action.client_entity_id.as_str(),
                    action.entity_type.as_str(),
                    action.entity_id.as_str(),
                    action.action_kind.as_str(),
                    json_value(action.payload.as_ref())?,
                    opt_int(action.baseline_version),
                    json_value(action.baseline_payload.as_ref())?,
                    action.priority,
                    i64::from(action.attempt_count),
                    i64::from(action.max_attempts),
                    action.enqueued_at,
                    action.next_attempt_at,
                    ActionOutcome::Pending.as_str()
                ],
            )
            .await?;

        if inserted == 1 {
            return Ok(EnqueueOutcome::Inserted(action.clone()));
        }

        self.find_by_client_key(&action.entity_type, &action.client_entity_id)
            .await?
            .map(EnqueueOutcome::Existing)
            .ok_or_else(|| {
                Error::Database(format!(
                    "queue entry {}/{} vanished after insert conflict",
                    action.entity_type, action.client_entity_id
                ))
            })
    }

    pub async fn get(&self, id: &ActionId) -> Result<Option<QueuedAction>> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {ACTION_COLUMNS} FROM queued_actions WHERE id = ?"),
                params![id.as_str()],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(Self::parse_action(&row)?)),
            None => Ok(None),
        }
    }

    pub async fn find_by_client_key(
        &self,
        entity_type: &str,
        client_entity_id: &str,
    ) -> Result<Option<QueuedAction>> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {ACTION_COLUMNS} FROM queued_actions
                     WHERE entity_type = ? AND client_entity_id = ?"
                ),
                params![entity_type, client_entity_id],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(Self::parse_action(&row)?)),
            None => Ok(None),
        }
    }

    /// Pending actions whose backoff has elapsed, in dequeue order
    pub async fn due(&self, now: i64, limit: usize) -> Result<Vec<QueuedAction>> {
        let rows = self
            .conn
            .query(
                &format!(
                    "SELECT {ACTION_COLUMNS} FROM queued_actions
                     WHERE outcome = 'pending' AND next_attempt_at <= ?
                     {DEQUEUE_ORDER} LIMIT ?"
                ),
                params![now, limit as i64],
            )
            .await?;
        Self::collect(rows).await
    }

    /// Due pending actions restricted to `ids`, in dequeue order
    pub async fn due_among(
        &self,
        ids: &[ActionId],
        now: i64,
        limit: usize,
    ) -> Result<Vec<QueuedAction>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders: Vec<&str> = ids.iter().map(|_| "?").collect();
        let sql = format!(
            "SELECT {ACTION_COLUMNS} FROM queued_actions
             WHERE outcome = 'pending' AND next_attempt_at <= ? AND id IN ({})
             {DEQUEUE_ORDER} LIMIT ?",
            placeholders.join(", ")
        );

        let mut values = Vec::with_capacity(ids.len() + 2);
        values.push(Value::Integer(now));
        values.extend(ids.iter().map(|id| Value::Text(id.as_str())));
        values.push(Value::Integer(limit as i64));

        let rows = self.conn.query(&sql, Params::Positional(values)).await?;
        Self::collect(rows).await
    }

    /// Queue entries submitted by a device, newest first
    pub async fn list_for_device(
        &self,
        user_id: &str,
        device_id: &str,
        limit: usize,
    ) -> Result<Vec<QueuedAction>> {
        let rows = self
            .conn
            .query(
                &format!(
                    "SELECT {ACTION_COLUMNS} FROM queued_actions
                     WHERE user_id = ? AND device_id = ?
                     ORDER BY enqueued_at DESC, id DESC LIMIT ?"
                ),
                params![user_id, device_id, limit as i64],
            )
            .await?;
        Self::collect(rows).await
    }

    pub async fn pending_count(&self) -> Result<u64> {
        let mut rows = self
            .conn
            .query(
                "SELECT COUNT(*) FROM queued_actions WHERE outcome = 'pending'",
                (),
            )
            .await?;
        let count: i64 = match rows.next().await? {
            Some(row) => row.get(0)?,
            None => 0,
        };
        u64::try_from(count).map_err(|_| Error::Database("negative queue count".to_string()))
    }

    /// pending -> applied, or conflicted -> applied
    pub async fn mark_applied(
        &self,
        id: &ActionId,
        from: ActionOutcome,
        applied_version: Option<i64>,
        conflict_id: Option<ConflictId>,
    ) -> Result<bool> {
        check_transition(from, ActionOutcome::Applied)?;
        let now = chrono::Utc::now().timestamp_millis();
        let rows = self
            .conn
            .execute(
                "UPDATE queued_actions SET
                    outcome = 'applied',
                    applied_at = ?,
                    applied_version = ?,
                    conflict_id = COALESCE(?, conflict_id),
                    failure_reason = NULL
                 WHERE id = ? AND outcome = ?",
                params![
                    now,
                    opt_int(applied_version),
                    opt_text(conflict_id.map(|id| id.as_str())),
                    id.as_str(),
                    from.as_str()
                ],
            )
            .await?;
        Ok(rows == 1)
    }

    /// pending -> conflicted, parked until a manual resolution arrives
    pub async fn mark_conflicted(&self, id: &ActionId, conflict_id: &ConflictId) -> Result<bool> {
        check_transition(ActionOutcome::Pending, ActionOutcome::Conflicted)?;
        let rows = self
            .conn
            .execute(
                "UPDATE queued_actions SET outcome = 'conflicted', conflict_id = ?
                 WHERE id = ? AND outcome = 'pending'",
                params![conflict_id.as_str(), id.as_str()],
            )
            .await?;
        Ok(rows == 1)
    }

    /// pending -> failed
    pub async fn mark_failed(
        &self,
        id: &ActionId,
        attempt_count: u32,
        reason: &str,
        retryable: bool,
    ) -> Result<bool> {
        check_transition(ActionOutcome::Pending, ActionOutcome::Failed)?;
        let rows = self
            .conn
            .execute(
                "UPDATE queued_actions SET
                    outcome = 'failed',
                    attempt_count = ?,
                    failure_reason = ?,
                    retryable = ?
                 WHERE id = ? AND outcome = 'pending'",
                params![
                    i64::from(attempt_count),
                    reason,
                    i32::from(retryable),
                    id.as_str()
                ],
            )
            .await?;
        Ok(rows == 1)
    }

    /// Keep a pending action queued after a transient failure
    pub async fn reschedule(
        &self,
        id: &ActionId,
        attempt_count: u32,
        next_attempt_at: i64,
        reason: &str,
    ) -> Result<bool> {
        let rows = self
            .conn
            .execute(
                "UPDATE queued_actions SET
                    attempt_count = ?,
                    next_attempt_at = ?,
                    failure_reason = ?
                 WHERE id = ? AND outcome = 'pending'",
                params![
                    i64::from(attempt_count),
                    next_attempt_at,
                    reason,
                    id.as_str()
                ],
            )
            .await?;
        Ok(rows == 1)
    }

    /// failed -> pending on explicit client resubmission; only retryable failures revive
    pub async fn revive(&self, id: &ActionId, now: i64) -> Result<bool> {
        check_transition(ActionOutcome::Failed, ActionOutcome::Pending)?;
        let rows = self
            .conn
            .execute(
                "UPDATE queued_actions SET
                    outcome = 'pending',
                    attempt_count = 0,
                    next_attempt_at = ?,
                    failure_reason = NULL,
                    retryable = 0
                 WHERE id = ? AND outcome = 'failed' AND retryable = 1",
                params![now, id.as_str()],
            )
            .await?;
        Ok(rows == 1)
    }

    /// conflicted -> abandoned, or failed -> abandoned
    pub async fn mark_abandoned(&self, id: &ActionId, from: ActionOutcome) -> Result<bool> {
        check_transition(from, ActionOutcome::Abandoned)?;
        let rows = self
            .conn
            .execute(
                "UPDATE queued_actions SET outcome = 'abandoned' WHERE id = ? AND outcome = ?",
                params![id.as_str(), from.as_str()],
            )
            .await?;
        Ok(rows == 1)
    }

    async fn collect(mut rows: libsql::Rows) -> Result<Vec<QueuedAction>> {
        let mut actions = Vec::new();
        while let Some(row) = rows.next().await? {
            actions.push(Self::parse_action(&row)?);
        }
        Ok(actions)
    }

    fn parse_action(row: &Row) -> Result<QueuedAction> {
        let id: String = row.get(0)?;
        let action_kind: String = row.get(6)?;
        let outcome: String = row.get(16)?;
        let conflict_id = row
            .get::<Option<String>>(20)?
            .map(|raw| raw.parse::<ConflictId>())
            .transpose()
            .map_err(|e| Error::Database(format!("invalid conflict id: {e}")))?;

        Ok(QueuedAction {
            id: id
                .parse()
                .map_err(|e| Error::Database(format!("invalid action id {id}: {e}")))?,
            user_id: row.get(1)?,
            device_id: row.get(2)?,
            client_entity_id: row.get(3)?,
            entity_type: row.get(4)?,
            entity_id: row.get(5)?,
            action_kind: action_kind.parse()?,
            payload: parse_json(row.get::<Option<String>>(7)?)?,
            baseline_version: row.get::<Option<i64>>(8)?,
            baseline_payload: parse_json(row.get::<Option<String>>(9)?)?,
            priority: row.get(10)?,
            attempt_count: to_u32(row.get(11)?, "attempt_count")?,
            max_attempts: to_u32(row.get(12)?, "max_attempts")?,
            enqueued_at: row.get(13)?,
            next_attempt_at: row.get(14)?,
            applied_at: row.get::<Option<i64>>(15)?,
            outcome: outcome.parse()?,
            failure_reason: row.get::<Option<String>>(17)?,
            retryable: row.get::<i32>(18)? != 0,
            applied_version: row.get::<Option<i64>>(19)?,
            conflict_id,
        })
    }
}

fn check_transition(from: ActionOutcome, to: ActionOutcome) -> Result<()> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(Error::Database(format!(
            "illegal queue transition {from} -> {to}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::models::{ActionKind, NewAction};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    async fn setup() -> Database {
        Database::open_in_memory().await.unwrap()
    }

    fn queued(client_entity_id: &str, device: &str, priority: i32, enqueued_at: i64) -> QueuedAction {
        let mut action = QueuedAction::from_new(
            "user-1",
            device,
            NewAction {
                client_entity_id: client_entity_id.to_string(),
                entity_type: "report".to_string(),
                action_kind: ActionKind::Create,
                entity_id: None,
                payload: Some(json!({"title": client_entity_id})),
                baseline_version: None,
                baseline_payload: None,
                priority,
            },
            3,
        );
        action.enqueued_at = enqueued_at;
        action.next_attempt_at = enqueued_at;
        action
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_insert_or_get_is_idempotent() {
        let db = setup().await;
        let repo = QueueRepository::new(db.connection());

        let action = queued("c1", "phone", 0, 10);
        let first = repo.insert_or_get(&action).await.unwrap();
        assert!(matches!(first, EnqueueOutcome::Inserted(_)));

        let duplicate = queued("c1", "phone", 0, 20);
        let EnqueueOutcome::Existing(existing) = repo.insert_or_get(&duplicate).await.unwrap()
        else {
            panic!("expected existing entry");
        };
        assert_eq!(existing.id, action.id);
        assert_eq!(existing.enqueued_at, 10);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_due_orders_by_priority_then_age() {
        let db = setup().await;
        let repo = QueueRepository::new(db.connection());

        repo.insert_or_get(&queued("old-low", "phone", 0, 10)).await.unwrap();
        repo.insert_or_get(&queued("new-high", "phone", 5, 30)).await.unwrap();
        repo.insert_or_get(&queued("old-high", "phone", 5, 20)).await.unwrap();
        repo.insert_or_get(&queued("future", "phone", 9, 500)).await.unwrap();

        let due = repo.due(100, 10).await.unwrap();
        let order: Vec<&str> = due.iter().map(|a| a.client_entity_id.as_str()).collect();
        assert_eq!(order, vec!["old-high", "new-high", "old-low"]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_due_among_filters_ids() {
        let db = setup().await;
        let repo = QueueRepository::new(db.connection());

        let a = queued("a", "phone", 0, 10);
        let b = queued("b", "phone", 1, 10);
        let c = queued("c", "phone", 2, 10);
        for action in [&a, &b, &c] {
            repo.insert_or_get(action).await.unwrap();
        }

        let due = repo.due_among(&[a.id, c.id], 100, 10).await.unwrap();
        let order: Vec<&str> = due.iter().map(|a| a.client_entity_id.as_str()).collect();
        assert_eq!(order, vec!["c", "a"]);

        assert!(repo.due_among(&[], 100, 10).await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_transitions_are_guarded_by_prior_outcome() {
        let db = setup().await;
        let repo = QueueRepository::new(db.connection());
        let action = queued("c1", "phone", 0, 10);
        repo.insert_or_get(&action).await.unwrap();

        assert!(repo
            .mark_applied(&action.id, ActionOutcome::Pending, Some(3), None)
            .await
            .unwrap());
        // Already applied: a second apply or a failure must not change anything
        assert!(!repo
            .mark_applied(&action.id, ActionOutcome::Pending, Some(4), None)
            .await
            .unwrap());
        assert!(!repo.mark_failed(&action.id, 1, "boom", true).await.unwrap());

        let stored = repo.get(&action.id).await.unwrap().unwrap();
        assert_eq!(stored.outcome, ActionOutcome::Applied);
        assert_eq!(stored.applied_version, Some(3));
        assert!(stored.applied_at.is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_illegal_transition_is_rejected() {
        let db = setup().await;
        let repo = QueueRepository::new(db.connection());
        let action = queued("c1", "phone", 0, 10);
        repo.insert_or_get(&action).await.unwrap();

        let err = repo
            .mark_abandoned(&action.id, ActionOutcome::Pending)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Database(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_revive_only_retryable_failures() {
        let db = setup().await;
        let repo = QueueRepository::new(db.connection());

        let transient = queued("transient", "phone", 0, 10);
        let permanent = queued("permanent", "phone", 0, 10);
        repo.insert_or_get(&transient).await.unwrap();
        repo.insert_or_get(&permanent).await.unwrap();

        repo.mark_failed(&transient.id, 3, "store unavailable", true)
            .await
            .unwrap();
        repo.mark_failed(&permanent.id, 1, "duplicate", false)
            .await
            .unwrap();

        assert!(repo.revive(&transient.id, 50).await.unwrap());
        assert!(!repo.revive(&permanent.id, 50).await.unwrap());

        let revived = repo.get(&transient.id).await.unwrap().unwrap();
        assert_eq!(revived.outcome, ActionOutcome::Pending);
        assert_eq!(revived.attempt_count, 0);
        assert_eq!(revived.next_attempt_at, 50);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_conflicted_actions_are_not_due() {
        let db = setup().await;
        let repo = QueueRepository::new(db.connection());
        let action = queued("c1", "phone", 0, 10);
        repo.insert_or_get(&action).await.unwrap();

        let conflict_id = ConflictId::new();
        assert!(repo.mark_conflicted(&action.id, &conflict_id).await.unwrap());
        assert!(repo.due(100, 10).await.unwrap().is_empty());
        assert_eq!(repo.pending_count().await.unwrap(), 0);

        let stored = repo.get(&action.id).await.unwrap().unwrap();
        assert_eq!(stored.conflict_id, Some(conflict_id));
    }
}
