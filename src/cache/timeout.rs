//! Per-operation deadline for cache calls.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use super::{CacheClient, CacheError, CacheResult};

/// Wraps a cache client so that every call is bounded by `timeout`.
///
/// An elapsed deadline surfaces as [`CacheError::Timeout`] and is handled by
/// callers exactly like any other store failure.
pub struct TimeoutCache<C> {
    inner: C,
    timeout: Duration,
}

impl<C: CacheClient> TimeoutCache<C> {
    pub fn new(inner: C, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }

    async fn bounded<T, F>(&self, op: &'static str, key: &str, fut: F) -> CacheResult<T>
    where
        F: Future<Output = CacheResult<T>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                warn!(op = op, key = %key, timeout = ?self.timeout, "Cache operation timed out");
                Err(CacheError::Timeout(self.timeout))
            }
        }
    }
}

#[async_trait]
impl<C: CacheClient> CacheClient for TimeoutCache<C> {
    async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        self.bounded("get", key, self.inner.get(key)).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<()> {
        self.bounded("set", key, self.inner.set(key, value, ttl)).await
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<bool> {
        self.bounded("set_nx", key, self.inner.set_nx(key, value, ttl))
            .await
    }

    async fn delete(&self, key: &str) -> CacheResult<()> {
        self.bounded("delete", key, self.inner.delete(key)).await
    }

    async fn increment(&self, key: &str) -> CacheResult<i64> {
        self.bounded("increment", key, self.inner.increment(key)).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> CacheResult<()> {
        self.bounded("expire", key, self.inner.expire(key, ttl)).await
    }

    async fn keys(&self, pattern: &str) -> CacheResult<Vec<String>> {
        self.bounded("keys", pattern, self.inner.keys(pattern)).await
    }

    fn purge_expired(&self) -> usize {
        self.inner.purge_expired()
    }
}
