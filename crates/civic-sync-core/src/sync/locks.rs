//! Per-entity mutual exclusion
//!
//! Queue processing for one (entity_type, entity_id) is strictly serial.
//! Actions on different entities never wait on each other.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type EntityKey = (String, String);
type Registry = Arc<Mutex<HashMap<EntityKey, Arc<AsyncMutex<()>>>>>;

#[derive(Clone, Default)]
pub struct EntityLocks {
    entries: Registry,
}

impl EntityLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to one entity
    pub async fn lock(&self, entity_type: &str, entity_id: &str) -> EntityGuard {
        let key = (entity_type.to_string(), entity_id.to_string());
        let mutex = {
            let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(entries.entry(key.clone()).or_default())
        };

        let claim = Claim {
            key,
            mutex,
            entries: Arc::clone(&self.entries),
        };
        // A waiter cancelled here still drops its claim, which reclaims the entry
        let guard = claim.acquire().await;
        EntityGuard {
            _guard: guard,
            _claim: claim,
        }
    }

    /// Entities with a holder or waiter
    pub fn active(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Interest in one entity's mutex, held from the start of waiting until release
struct Claim {
    key: EntityKey,
    mutex: Arc<AsyncMutex<()>>,
    entries: Registry,
}

impl Claim {
    async fn acquire(&self) -> OwnedMutexGuard<()> {
        Arc::clone(&self.mutex).lock_owned().await
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        // One reference in the map, one here
        if Arc::strong_count(&self.mutex) == 2 {
            entries.remove(&self.key);
        }
    }
}

/// Held for one action's read-check-write
///
/// Fields drop in order: the mutex is released before the claim checks
/// whether anyone else still holds or awaits the entry.
pub struct EntityGuard {
    _guard: OwnedMutexGuard<()>,
    _claim: Claim,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread")]
    async fn test_same_entity_is_serialized() {
        let locks = EntityLocks::new();
        let guard = locks.lock("report", "r-1").await;

        let contender = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.lock("report", "r-1").await;
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!contender.is_finished());

        drop(guard);
        contender.await.unwrap();
        assert_eq!(locks.active(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_distinct_entities_do_not_block() {
        let locks = EntityLocks::new();
        let _first = locks.lock("report", "r-1").await;
        let second = tokio::time::timeout(Duration::from_secs(1), locks.lock("report", "r-2")).await;
        assert!(second.is_ok());
        assert_eq!(locks.active(), 2);
    }

    #[tokio::test]
    async fn test_cancelled_waiter_releases_entry() {
        let locks = EntityLocks::new();
        let holder = locks.lock("report", "r-1").await;

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.lock("report", "r-1").await;
            })
        };
        // Let the waiter register and park on the mutex
        tokio::task::yield_now().await;

        // Released while the waiter is still queued, then the waiter gives up
        drop(holder);
        waiter.abort();
        assert!(waiter.await.unwrap_err().is_cancelled());

        assert_eq!(locks.active(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_timed_out_waiter_leaves_no_entry() {
        let locks = EntityLocks::new();
        let holder = locks.lock("report", "r-1").await;

        let waited =
            tokio::time::timeout(Duration::from_millis(20), locks.lock("report", "r-1")).await;
        assert!(waited.is_err());
        assert_eq!(locks.active(), 1);

        drop(holder);
        assert_eq!(locks.active(), 0);
    }
}
