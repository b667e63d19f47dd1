//! Background retry worker: drains pending actions whose backoff has elapsed

use std::sync::Arc;
use std::time::Duration;

use civic_sync_core::sync::{now_ms, DrainReport};
use civic_sync_core::SyncEngine;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

pub fn spawn(
    engine: Arc<SyncEngine>,
    interval: Duration,
    batch_size: usize,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(run(engine, interval, batch_size, shutdown))
}

async fn run(
    engine: Arc<SyncEngine>,
    interval: Duration,
    batch_size: usize,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tracing::info!(interval_ms = interval.as_millis(), batch_size, "retry worker started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                drain_once(&engine, batch_size).await;
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    tracing::info!("retry worker stopped");
}

async fn drain_once(engine: &SyncEngine, batch_size: usize) -> Option<DrainReport> {
    match engine.drain_due(now_ms(), batch_size).await {
        Ok(report) => {
            if report.processed > 0 || report.errors > 0 {
                tracing::info!(
                    processed = report.processed,
                    applied = report.applied,
                    conflicted = report.conflicted,
                    failed = report.failed,
                    rescheduled = report.rescheduled,
                    errors = report.errors,
                    "retry worker pass"
                );
            }
            Some(report)
        }
        Err(error) => {
            tracing::error!(%error, "retry worker pass failed");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use civic_sync_core::db::Database;
    use civic_sync_core::models::{ActionKind, ActionOutcome, NewAction};
    use civic_sync_core::SyncConfig;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    fn create(key: &str) -> NewAction {
        NewAction {
            client_entity_id: key.to_string(),
            entity_type: "report".to_string(),
            action_kind: ActionKind::Create,
            entity_id: None,
            payload: Some(json!({"title": key})),
            baseline_version: None,
            baseline_payload: None,
            priority: 0,
        }
    }

    async fn engine_with_backlog() -> Arc<SyncEngine> {
        let config = SyncConfig {
            upload_batch_size: 1,
            ..SyncConfig::default()
        };
        let db = Arc::new(Database::open_in_memory().await.unwrap());
        let engine = Arc::new(SyncEngine::local(db, config));
        let upload = engine
            .batch_upload("user-1", "phone", vec![create("c1"), create("c2"), create("c3")])
            .await
            .unwrap();
        let pending = upload
            .results
            .iter()
            .filter(|r| r.outcome == ActionOutcome::Pending)
            .count();
        assert_eq!(pending, 2);
        engine
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn drain_once_applies_backlog() {
        let engine = engine_with_backlog().await;
        let report = drain_once(&engine, 10).await.unwrap();
        assert_eq!(report.applied, 2);
        assert_eq!(engine.pending_count().await.unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn worker_drains_until_shutdown() {
        let engine = engine_with_backlog().await;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = spawn(
            Arc::clone(&engine),
            Duration::from_millis(10),
            10,
            shutdown_rx,
        );

        tokio::time::timeout(Duration::from_secs(5), async {
            while engine.pending_count().await.unwrap() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
