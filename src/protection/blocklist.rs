//! Address deny-list shared across instances.
//!
//! Auto-blocked addresses live in the cache as `ddos:block:{ip}` with a TTL,
//! so every instance sees them and they lapse on their own. A local mirror
//! keeps a block in force while the cache is unreachable.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::cache::{CacheClient, CacheResult};

const BLOCK_KEY_PREFIX: &str = "ddos:block";

/// Static and time-bounded address blocks.
pub struct Blocklist {
    cache: Arc<dyn CacheClient>,
    /// Configured entries; these never expire.
    permanent: RwLock<HashSet<String>>,
    /// Local view of auto-blocks and when they lapse.
    local: DashMap<String, Instant>,
    ttl: Duration,
}

impl Blocklist {
    pub fn new(
        cache: Arc<dyn CacheClient>,
        permanent: impl IntoIterator<Item = String>,
        ttl: Duration,
    ) -> Self {
        Self {
            cache,
            permanent: RwLock::new(permanent.into_iter().collect()),
            local: DashMap::new(),
            ttl,
        }
    }

    fn cache_key(ip: &str) -> String {
        format!("{}:{}", BLOCK_KEY_PREFIX, ip)
    }

    /// Whether `ip` is blocked statically, locally or by another instance.
    pub async fn is_blocked(&self, ip: &str) -> bool {
        if self.permanent.read().contains(ip) {
            return true;
        }
        if self.locally_blocked(ip) {
            return true;
        }
        match self.cache.get(&Self::cache_key(ip)).await {
            Ok(entry) => entry.is_some(),
            Err(e) => {
                warn!(ip = %ip, error = %e, "Block lookup failed, using local entries only");
                false
            }
        }
    }

    fn locally_blocked(&self, ip: &str) -> bool {
        let now = Instant::now();
        match self.local.get(ip).map(|e| *e.value()) {
            Some(until) if until > now => true,
            Some(_) => {
                self.local.remove_if(ip, |_, until| *until <= now);
                false
            }
            None => false,
        }
    }

    /// Block `ip` for the configured duration.
    ///
    /// The local entry is recorded even if the cache write fails.
    pub async fn block(&self, ip: &str) -> CacheResult<()> {
        self.local.insert(ip.to_string(), Instant::now() + self.ttl);
        info!(ip = %ip, duration = ?self.ttl, "Blocking address");
        self.cache.set(&Self::cache_key(ip), "1", self.ttl).await
    }

    /// Add a block that never expires.
    pub fn block_permanently(&self, ip: impl Into<String>) {
        let ip = ip.into();
        info!(ip = %ip, "Adding address to deny list");
        self.permanent.write().insert(ip);
    }

    /// Lift every kind of block on `ip`.
    pub async fn unblock(&self, ip: &str) -> CacheResult<()> {
        self.permanent.write().remove(ip);
        self.local.remove(ip);
        info!(ip = %ip, "Unblocking address");
        self.cache.delete(&Self::cache_key(ip)).await
    }

    /// Drop lapsed local entries. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.local.len();
        self.local.retain(|_, until| *until > now);
        before - self.local.len()
    }

    /// Number of blocks this instance knows about.
    pub fn blocked_count(&self) -> usize {
        self.permanent.read().len() + self.local.len()
    }

    pub fn block_duration(&self) -> Duration {
        self.ttl
    }
}
