//! Sliding window log strategy.
//!
//! Every admitted request leaves a marker `{prefix}:{key}:entry:{millis}-{id}`
//! whose TTL equals the window, so the live markers are exactly the requests
//! admitted during the last window. Counting costs a pattern scan per call.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use super::lock::KeyLock;
use super::types::{chrono_duration, degrade, RateLimitConfig, RateLimitResult, RateLimiter};
use crate::cache::{glob_escape, CacheClient, CacheResult};
use crate::error::Result;

/// Sliding window rate limiter backed by per-request cache markers.
pub struct SlidingWindowLimiter {
    config: RateLimitConfig,
    cache: Arc<dyn CacheClient>,
    lock: KeyLock,
}

/// Live markers for a key, plus the timestamp of the oldest one.
struct WindowLog {
    count: u64,
    oldest: Option<DateTime<Utc>>,
}

impl SlidingWindowLimiter {
    pub fn new(config: RateLimitConfig, cache: Arc<dyn CacheClient>) -> Self {
        let lock = KeyLock::new(cache.clone());
        Self {
            config,
            cache,
            lock,
        }
    }

    fn base_key(&self, key: &str) -> String {
        format!("{}:{}", self.config.key_prefix, key)
    }

    fn entry_prefix(&self, key: &str) -> String {
        format!("{}:entry:", self.base_key(key))
    }

    /// Timestamp of a marker written under `prefix` by [`Self::add_entry`].
    ///
    /// Keys of other callers that merely share the prefix yield `None`.
    fn marker_timestamp(prefix: &str, marker: &str) -> Option<i64> {
        let (millis, id) = marker.strip_prefix(prefix)?.split_once('-')?;
        if millis.is_empty() || !millis.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        if id.is_empty() || !id.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        millis.parse().ok()
    }

    /// This key's markers. The caller key is escaped so glob characters in
    /// it cannot widen the scan to other keys.
    async fn markers(&self, key: &str) -> CacheResult<Vec<(String, i64)>> {
        let prefix = self.entry_prefix(key);
        let candidates = self.cache.keys(&format!("{}*", glob_escape(&prefix))).await?;
        Ok(candidates
            .into_iter()
            .filter_map(|marker| {
                let ts = Self::marker_timestamp(&prefix, &marker)?;
                Some((marker, ts))
            })
            .collect())
    }

    /// Count live markers, deleting ones that have aged out of the window.
    async fn scan(&self, key: &str, now: DateTime<Utc>) -> CacheResult<WindowLog> {
        let window_start_ms = (now - chrono_duration(self.config.window)).timestamp_millis();

        let mut log = WindowLog {
            count: 0,
            oldest: None,
        };
        for (marker, ts) in self.markers(key).await? {
            if ts <= window_start_ms {
                // Best-effort cleanup; the marker TTL removes it anyway.
                if let Err(e) = self.cache.delete(&marker).await {
                    warn!(marker = %marker, error = %e, "Failed to delete stale window marker");
                }
                continue;
            }
            log.count += 1;
            let at = DateTime::from_timestamp_millis(ts);
            log.oldest = match (log.oldest, at) {
                (Some(old), Some(at)) => Some(old.min(at)),
                (None, at) => at,
                (old, None) => old,
            };
        }
        Ok(log)
    }

    async fn add_entry(&self, key: &str, now: DateTime<Utc>) -> CacheResult<()> {
        let marker = format!(
            "{}{}-{}",
            self.entry_prefix(key),
            now.timestamp_millis(),
            Uuid::new_v4().simple()
        );
        self.cache.set(&marker, "1", self.config.window).await
    }

    /// When the oldest live marker leaves the window, one permit frees up.
    fn next_release(&self, log: &WindowLog, now: DateTime<Utc>) -> DateTime<Utc> {
        let window = chrono_duration(self.config.window);
        log.oldest.map(|t| t + window).unwrap_or(now + window)
    }

    async fn allow_locked(&self, key: &str, now: DateTime<Utc>) -> Result<RateLimitResult> {
        let log = match self.scan(key, now).await {
            Ok(log) => log,
            Err(e) => return degrade(&self.config, key, now + chrono_duration(self.config.window), e),
        };

        if log.count >= self.config.limit {
            let reset_time = self.next_release(&log, now);
            let retry_after = (reset_time - now).to_std().unwrap_or(Duration::ZERO);
            warn!(
                key = %key,
                count = log.count,
                limit = self.config.limit,
                retry_after = ?retry_after,
                "Sliding window limit reached"
            );
            return Ok(RateLimitResult {
                allowed: false,
                limit: self.config.limit,
                remaining: 0,
                reset_time,
                retry_after,
                strategy: self.config.strategy,
                key: key.to_string(),
            });
        }

        if let Err(e) = self.add_entry(key, now).await {
            return degrade(&self.config, key, now + chrono_duration(self.config.window), e);
        }

        let remaining = self.config.limit.saturating_sub(log.count + 1);
        debug!(
            key = %key,
            count = log.count + 1,
            limit = self.config.limit,
            remaining = remaining,
            "Sliding window check passed"
        );

        Ok(RateLimitResult {
            allowed: true,
            limit: self.config.limit,
            remaining,
            reset_time: now + chrono_duration(self.config.window),
            retry_after: Duration::ZERO,
            strategy: self.config.strategy,
            key: key.to_string(),
        })
    }
}

#[async_trait]
impl RateLimiter for SlidingWindowLimiter {
    async fn allow(&self, key: &str) -> Result<RateLimitResult> {
        trace!(key = %key, "Checking sliding window");

        let lock_key = format!("{}:lock", self.base_key(key));
        let guard = match self.lock.acquire(&lock_key).await {
            Ok(guard) => guard,
            Err(e) => {
                let now = Utc::now();
                return degrade(&self.config, key, now + chrono_duration(self.config.window), e);
            }
        };

        let result = self.allow_locked(key, Utc::now()).await;

        if let Some(guard) = guard {
            self.lock.release(guard).await;
        }
        result
    }

    async fn reset(&self, key: &str) -> Result<()> {
        for (k, _) in self.markers(key).await? {
            if let Err(e) = self.cache.delete(&k).await {
                warn!(key = %k, error = %e, "Failed to delete window marker during reset");
            }
        }
        info!(key = %key, strategy = %self.config.strategy, "Rate limit reset");
        Ok(())
    }

    async fn get_limit(&self, key: &str) -> Result<RateLimitResult> {
        let now = Utc::now();
        let log = match self.scan(key, now).await {
            Ok(log) => log,
            Err(e) => return degrade(&self.config, key, now + chrono_duration(self.config.window), e),
        };
        let allowed = log.count < self.config.limit;
        let reset_time = self.next_release(&log, now);

        Ok(RateLimitResult {
            allowed,
            limit: self.config.limit,
            remaining: self.config.limit.saturating_sub(log.count),
            reset_time,
            retry_after: if allowed {
                Duration::ZERO
            } else {
                (reset_time - now).to_std().unwrap_or(Duration::ZERO)
            },
            strategy: self.config.strategy,
            key: key.to_string(),
        })
    }

    fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    fn with_config(&self, config: RateLimitConfig) -> Arc<dyn RateLimiter> {
        Arc::new(Self::new(config, self.cache.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::testing::FailingCache;
    use crate::cache::MemoryCache;
    use crate::ratelimit::StrategyKind;

    fn config(limit: u64, window: Duration) -> RateLimitConfig {
        RateLimitConfig::for_strategy(StrategyKind::SlidingWindow)
            .with_limit(limit)
            .with_window(window)
    }

    fn limiter(limit: u64, window: Duration) -> SlidingWindowLimiter {
        SlidingWindowLimiter::new(config(limit, window), Arc::new(MemoryCache::new()))
    }

    #[test]
    fn test_marker_timestamp_parsing() {
        let prefix = "rl:k:entry:";
        assert_eq!(
            SlidingWindowLimiter::marker_timestamp(prefix, "rl:k:entry:1700000000123-abcdef"),
            Some(1_700_000_000_123)
        );
        assert_eq!(
            SlidingWindowLimiter::marker_timestamp(prefix, "rl:k:entry:garbage"),
            None
        );
        // A marker of the caller key `k:entry:1` shares the prefix.
        assert_eq!(
            SlidingWindowLimiter::marker_timestamp(prefix, "rl:k:entry:1:entry:1700000000123-abcdef"),
            None
        );
    }

    #[tokio::test]
    async fn test_glob_characters_in_key_stay_literal() {
        let cache = Arc::new(MemoryCache::new());
        let limiter = SlidingWindowLimiter::new(config(2, Duration::from_secs(60)), cache.clone());
        let victim = "ip:1.2.3.4:/api/expensive";
        let wildcard = "ip:1.2.3.4:/api/*";

        assert!(limiter.allow(victim).await.unwrap().allowed);
        assert!(limiter.allow(victim).await.unwrap().allowed);
        assert!(!limiter.allow(victim).await.unwrap().allowed);

        let other = limiter.allow(wildcard).await.unwrap();
        assert!(other.allowed);
        assert_eq!(other.remaining, 1);
        assert_eq!(limiter.get_limit(wildcard).await.unwrap().remaining, 1);

        limiter.reset(wildcard).await.unwrap();
        limiter.reset("ip:1.2.3.4:/api/?xpensive").await.unwrap();

        let still_denied = limiter.allow(victim).await.unwrap();
        assert!(!still_denied.allowed);
        assert_eq!(
            cache
                .keys(&format!("rate_limit:{}:entry:*", glob_escape(victim)))
                .await
                .unwrap()
                .len(),
            2
        );
    }

    #[tokio::test]
    async fn test_exact_limit_then_denied() {
        let limiter = limiter(5, Duration::from_secs(60));

        for expected_remaining in (0..5).rev() {
            let result = limiter.allow("k").await.unwrap();
            assert!(result.allowed);
            assert_eq!(result.remaining, expected_remaining);
        }

        let denied = limiter.allow("k").await.unwrap();
        assert!(!denied.allowed);
        assert!(denied.retry_after > Duration::ZERO);
        assert!(denied.retry_after <= Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_no_carry_over_past_window() {
        let window = Duration::from_millis(600);
        let limiter = limiter(3, window);

        // Spread the admissions across the window.
        for _ in 0..3 {
            assert!(limiter.allow("k").await.unwrap().allowed);
            tokio::time::sleep(Duration::from_millis(150)).await;
        }
        assert!(!limiter.allow("k").await.unwrap().allowed);

        tokio::time::sleep(window + Duration::from_millis(50)).await;
        let result = limiter.allow("k").await.unwrap();
        assert!(result.allowed);
        assert_eq!(result.remaining, 2);
    }

    #[tokio::test]
    async fn test_reset_clears_markers() {
        let cache = Arc::new(MemoryCache::new());
        let limiter = SlidingWindowLimiter::new(config(2, Duration::from_secs(60)), cache.clone());

        limiter.allow("k").await.unwrap();
        limiter.allow("k").await.unwrap();
        assert!(!limiter.allow("k").await.unwrap().allowed);

        limiter.reset("k").await.unwrap();
        assert!(cache.keys("rate_limit:k:*").await.unwrap().is_empty());
        let result = limiter.allow("k").await.unwrap();
        assert!(result.allowed);
        assert_eq!(result.remaining, 1);
    }

    #[tokio::test]
    async fn test_get_limit_reports_without_consuming() {
        let limiter = limiter(3, Duration::from_secs(60));
        limiter.allow("k").await.unwrap();

        let status = limiter.get_limit("k").await.unwrap();
        assert!(status.allowed);
        assert_eq!(status.remaining, 2);
        assert_eq!(limiter.get_limit("k").await.unwrap().remaining, 2);
    }

    #[tokio::test]
    async fn test_concurrent_calls_do_not_over_admit() {
        let limiter = Arc::new(limiter(10, Duration::from_secs(60)));
        let mut handles = Vec::new();
        for _ in 0..25 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move { limiter.allow("k").await.unwrap().allowed }));
        }

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }
        assert!(admitted <= 10);
    }

    #[tokio::test]
    async fn test_fail_open_and_propagation() {
        let open = SlidingWindowLimiter::new(config(4, Duration::from_secs(60)), Arc::new(FailingCache::new()));
        let result = open.allow("k").await.unwrap();
        assert!(result.allowed);
        assert_eq!(result.remaining, 4);

        let strict = SlidingWindowLimiter::new(
            config(4, Duration::from_secs(60)).with_skip_on_error(false),
            Arc::new(FailingCache::new()),
        );
        assert!(strict.allow("k").await.is_err());
    }
}
