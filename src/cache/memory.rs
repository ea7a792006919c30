//! In-process cache backend.
//!
//! Useful for single-instance deployments and tests. Quota state held here
//! is not shared between processes.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::trace;

use super::{glob_match, CacheClient, CacheError, CacheResult};

#[derive(Debug, Clone)]
struct StoredValue {
    value: String,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// A `DashMap`-backed store with per-entry expiry.
///
/// Expired entries are dropped lazily when touched and by [`CacheClient::purge_expired`].
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: DashMap<String, StoredValue>,
}

impl MemoryCache {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.iter().filter(|e| !e.is_expired(now)).count()
    }

    /// Number of entries held, including expired ones not yet purged.
    pub fn stored(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store holds no live entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CacheClient for MemoryCache {
    async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        let now = Instant::now();
        if let Entry::Occupied(entry) = self.entries.entry(key.to_string()) {
            if entry.get().is_expired(now) {
                entry.remove();
                return Ok(None);
            }
            return Ok(Some(entry.get().value.clone()));
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<()> {
        self.entries.insert(
            key.to_string(),
            StoredValue {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<bool> {
        let now = Instant::now();
        let stored = StoredValue {
            value: value.to_string(),
            expires_at: Some(now + ttl),
        };
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                if entry.get().is_expired(now) {
                    entry.insert(stored);
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(stored);
                Ok(true)
            }
        }
    }

    async fn delete(&self, key: &str) -> CacheResult<()> {
        self.entries.remove(key);
        Ok(())
    }

    async fn increment(&self, key: &str) -> CacheResult<i64> {
        let now = Instant::now();
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                if entry.get().is_expired(now) {
                    entry.insert(StoredValue {
                        value: "1".to_string(),
                        expires_at: None,
                    });
                    return Ok(1);
                }
                let current: i64 =
                    entry
                        .get()
                        .value
                        .parse()
                        .map_err(|_| CacheError::InvalidValue {
                            key: key.to_string(),
                            reason: "value is not an integer".to_string(),
                        })?;
                let next = current + 1;
                entry.get_mut().value = next.to_string();
                Ok(next)
            }
            Entry::Vacant(entry) => {
                entry.insert(StoredValue {
                    value: "1".to_string(),
                    expires_at: None,
                });
                Ok(1)
            }
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> CacheResult<()> {
        if let Some(mut entry) = self.entries.get_mut(key) {
            entry.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }

    async fn keys(&self, pattern: &str) -> CacheResult<Vec<String>> {
        let now = Instant::now();
        let keys: Vec<String> = self
            .entries
            .iter()
            .filter(|e| !e.value().is_expired(now) && glob_match(pattern, e.key()))
            .map(|e| e.key().clone())
            .collect();
        trace!(pattern = %pattern, matched = keys.len(), "Enumerated cache keys");
        Ok(keys)
    }

    fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, v| !v.is_expired(now));
        before.saturating_sub(self.entries.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_get_missing_key_is_none() {
        let cache = MemoryCache::new();
        assert_eq!(cache.get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_set_and_get() {
        let cache = MemoryCache::new();
        cache.set("k", "v", Duration::from_secs(10)).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), Some("v".to_string()));
    }

    #[tokio::test]
    async fn test_entries_expire() {
        let cache = MemoryCache::new();
        cache.set("k", "v", Duration::from_millis(30)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(cache.get("k").await.unwrap(), None);
        assert!(cache.keys("*").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_increment_creates_at_one() {
        let cache = MemoryCache::new();
        assert_eq!(cache.increment("c").await.unwrap(), 1);
        assert_eq!(cache.increment("c").await.unwrap(), 2);
        assert_eq!(cache.get("c").await.unwrap(), Some("2".to_string()));
    }

    #[tokio::test]
    async fn test_increment_rejects_non_integer() {
        let cache = MemoryCache::new();
        cache.set("c", "abc", Duration::from_secs(10)).await.unwrap();
        let err = cache.increment("c").await.unwrap_err();
        assert!(matches!(err, CacheError::InvalidValue { .. }));
    }

    #[tokio::test]
    async fn test_expire_applies_ttl_to_counter() {
        let cache = MemoryCache::new();
        cache.increment("c").await.unwrap();
        cache.expire("c", Duration::from_millis(30)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(cache.increment("c").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_set_nx() {
        let cache = MemoryCache::new();
        assert!(cache.set_nx("lock", "1", Duration::from_secs(1)).await.unwrap());
        assert!(!cache.set_nx("lock", "1", Duration::from_secs(1)).await.unwrap());
        cache.delete("lock").await.unwrap();
        assert!(cache.set_nx("lock", "1", Duration::from_secs(1)).await.unwrap());
    }

    #[tokio::test]
    async fn test_keys_pattern() {
        let cache = MemoryCache::new();
        let ttl = Duration::from_secs(10);
        cache.set("rl:a:entry:1", "1", ttl).await.unwrap();
        cache.set("rl:a:entry:2", "1", ttl).await.unwrap();
        cache.set("rl:b:entry:1", "1", ttl).await.unwrap();

        let mut keys = cache.keys("rl:a:entry:*").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["rl:a:entry:1", "rl:a:entry:2"]);
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let cache = MemoryCache::new();
        cache.set("short", "1", Duration::from_millis(10)).await.unwrap();
        cache.set("long", "1", Duration::from_secs(10)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.stored(), 1);
    }

    #[tokio::test]
    async fn test_window_counters_do_not_accumulate() {
        let cache = MemoryCache::new();
        for window in 0..20 {
            let key = format!("rl:k{}:window:{}", window % 4, window);
            cache.increment(&key).await.unwrap();
            cache.expire(&key, Duration::from_millis(10)).await.unwrap();
        }
        assert_eq!(cache.stored(), 20);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.purge_expired(), 20);
        assert_eq!(cache.stored(), 0);
    }
}
