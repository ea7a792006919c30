//! Short-lived per-key locks held in the shared cache.
//!
//! The token bucket and sliding window do a read, compute, write sequence
//! against the cache. Holding `{prefix}:{key}:lock` for the duration of that
//! sequence keeps concurrent callers, in this process or another one, from
//! interleaving on the same key.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{trace, warn};
use uuid::Uuid;

use crate::cache::{CacheClient, CacheResult};

/// How long a lock survives if its holder never releases it.
const LOCK_TTL: Duration = Duration::from_secs(1);
/// How long to wait for a contended lock before giving up.
const LOCK_WAIT: Duration = Duration::from_millis(50);
/// Pause between acquisition attempts.
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(2);

/// Acquires and releases cache-held locks.
#[derive(Clone)]
pub struct KeyLock {
    cache: Arc<dyn CacheClient>,
    wait: Duration,
}

/// Proof of lock ownership. Release it with [`KeyLock::release`].
#[derive(Debug)]
pub struct LockGuard {
    key: String,
    token: String,
}

impl KeyLock {
    pub fn new(cache: Arc<dyn CacheClient>) -> Self {
        Self {
            cache,
            wait: LOCK_WAIT,
        }
    }

    /// Try to take the lock for `lock_key`, waiting up to the configured bound.
    ///
    /// `Ok(None)` means the lock stayed contended; the caller proceeds without it.
    pub async fn acquire(&self, lock_key: &str) -> CacheResult<Option<LockGuard>> {
        let token = Uuid::new_v4().to_string();
        let deadline = Instant::now() + self.wait;

        loop {
            if self.cache.set_nx(lock_key, &token, LOCK_TTL).await? {
                trace!(lock = %lock_key, "Acquired key lock");
                return Ok(Some(LockGuard {
                    key: lock_key.to_string(),
                    token,
                }));
            }
            if Instant::now() >= deadline {
                warn!(lock = %lock_key, wait = ?self.wait, "Key lock contended, proceeding unlocked");
                return Ok(None);
            }
            tokio::time::sleep(LOCK_RETRY_INTERVAL).await;
        }
    }

    /// Release a lock if we still own it. Failures are logged and ignored;
    /// the lock TTL bounds how long a leaked lock can block others.
    pub async fn release(&self, guard: LockGuard) {
        match self.cache.get(&guard.key).await {
            Ok(Some(current)) if current == guard.token => {
                if let Err(e) = self.cache.delete(&guard.key).await {
                    warn!(lock = %guard.key, error = %e, "Failed to release key lock");
                }
            }
            Ok(_) => trace!(lock = %guard.key, "Key lock already expired"),
            Err(e) => warn!(lock = %guard.key, error = %e, "Failed to release key lock"),
        }
    }
}
