//! Per-execution lock manager
//!
//! Mutual exclusion across processes rides on the store's unique constraint
//! for `workflow_locks.execution_id`. Acquisition is non-blocking: whether
//! contention means "fail" or "queue" is the engine's policy, not ours.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::clock::Clock;
use crate::persistence::{StoreError, WorkflowStore};

/// Default lock lifetime before a crashed holder's lock becomes reclaimable
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(300);

/// Acquires and releases per-execution locks
pub struct LockManager {
    store: Arc<dyn WorkflowStore>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
}

impl LockManager {
    pub fn new(store: Arc<dyn WorkflowStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            ttl: DEFAULT_LOCK_TTL,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Try to take the lock for an execution
    ///
    /// On contention, reclaims expired rows once and retries; a second
    /// refusal means a live holder exists.
    pub async fn acquire(&self, execution_id: &str, lock_key: &str) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let expires_at = now + chrono::Duration::milliseconds(self.ttl.as_millis() as i64);

        if self
            .store
            .acquire_lock(execution_id, lock_key, now, expires_at)
            .await?
        {
            return Ok(true);
        }

        let reclaimed = self.store.cleanup_expired_locks(now).await?;
        if reclaimed == 0 {
            return Ok(false);
        }

        debug!(execution_id, reclaimed, "reclaimed expired locks, retrying acquire");
        self.store
            .acquire_lock(execution_id, lock_key, now, expires_at)
            .await
    }

    /// Release the lock; `false` when no row existed
    pub async fn release(&self, execution_id: &str) -> Result<bool, StoreError> {
        self.store.release_lock(execution_id).await
    }

    /// Delete every lock with `expires_at <= now`, returning the count
    pub async fn cleanup_expired(&self) -> Result<u64, StoreError> {
        self.store.cleanup_expired_locks(self.clock.now()).await
    }
}
