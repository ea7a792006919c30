//! Fixed window counter strategy.
//!
//! Time is cut into windows aligned to the epoch; each window gets its own
//! counter `{prefix}:{key}:window:{windowStartMillis}` that expires with the
//! window. A burst straddling a boundary can see up to twice the limit in a
//! short interval.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info, trace, warn};

use super::types::{chrono_duration, degrade, RateLimitConfig, RateLimitResult, RateLimiter};
use crate::cache::{CacheClient, CacheError, CacheResult};
use crate::error::Result;

/// Boundaries of the window containing a given instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct WindowSpan {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl WindowSpan {
    /// The epoch-aligned window of length `window` containing `now`.
    pub fn containing(now: DateTime<Utc>, window: Duration) -> Self {
        let window_ms = (window.as_millis() as i64).max(1);
        let now_ms = now.timestamp_millis();
        let start_ms = now_ms - now_ms.rem_euclid(window_ms);
        let start = DateTime::from_timestamp_millis(start_ms).unwrap_or(now);
        Self {
            start,
            end: start + chrono_duration(window),
        }
    }

    /// Time left in this window as seen from `now`.
    pub fn remaining_from(&self, now: DateTime<Utc>) -> Duration {
        (self.end - now).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Fixed window rate limiter backed by atomic cache counters.
pub struct FixedWindowLimiter {
    config: RateLimitConfig,
    cache: Arc<dyn CacheClient>,
}

impl FixedWindowLimiter {
    pub fn new(config: RateLimitConfig, cache: Arc<dyn CacheClient>) -> Self {
        Self { config, cache }
    }

    fn window_key(&self, key: &str, span: &WindowSpan) -> String {
        format!(
            "{}:{}:window:{}",
            self.config.key_prefix,
            key,
            span.start.timestamp_millis()
        )
    }

    async fn current_count(&self, window_key: &str) -> CacheResult<u64> {
        match self.cache.get(window_key).await? {
            None => Ok(0),
            Some(raw) => raw.trim().parse().map_err(|_| CacheError::InvalidValue {
                key: window_key.to_string(),
                reason: format!("counter '{}' is not an integer", raw),
            }),
        }
    }

    /// Increment the window counter, attaching the window TTL when it is created.
    async fn increment_count(&self, window_key: &str) -> CacheResult<u64> {
        let count = self.cache.increment(window_key).await?;
        if count == 1 {
            if let Err(e) = self.cache.expire(window_key, self.config.window).await {
                warn!(
                    key = %window_key,
                    window = ?self.config.window,
                    error = %e,
                    "Failed to set window counter expiry"
                );
            }
        }
        Ok(count.max(0) as u64)
    }

    fn denied(&self, key: &str, span: &WindowSpan, now: DateTime<Utc>, count: u64) -> RateLimitResult {
        let retry_after = span.remaining_from(now);
        warn!(
            key = %key,
            count = count,
            limit = self.config.limit,
            retry_after = ?retry_after,
            "Fixed window limit reached"
        );
        RateLimitResult {
            allowed: false,
            limit: self.config.limit,
            remaining: 0,
            reset_time: span.end,
            retry_after,
            strategy: self.config.strategy,
            key: key.to_string(),
        }
    }
}

#[async_trait]
impl RateLimiter for FixedWindowLimiter {
    async fn allow(&self, key: &str) -> Result<RateLimitResult> {
        let now = Utc::now();
        let span = WindowSpan::containing(now, self.config.window);
        let window_key = self.window_key(key, &span);

        trace!(key = %key, window_key = %window_key, "Checking fixed window");

        let count = match self.current_count(&window_key).await {
            Ok(count) => count,
            Err(e) => return degrade(&self.config, key, span.end, e),
        };
        if count >= self.config.limit {
            return Ok(self.denied(key, &span, now, count));
        }

        let new_count = match self.increment_count(&window_key).await {
            Ok(count) => count,
            Err(e) => return degrade(&self.config, key, span.end, e),
        };
        // Concurrent callers may have raced past the read above.
        if new_count > self.config.limit {
            return Ok(self.denied(key, &span, now, new_count));
        }

        let remaining = self.config.limit.saturating_sub(new_count);
        debug!(
            key = %key,
            count = new_count,
            limit = self.config.limit,
            remaining = remaining,
            "Fixed window check passed"
        );

        Ok(RateLimitResult {
            allowed: true,
            limit: self.config.limit,
            remaining,
            reset_time: span.end,
            retry_after: Duration::ZERO,
            strategy: self.config.strategy,
            key: key.to_string(),
        })
    }

    async fn reset(&self, key: &str) -> Result<()> {
        let span = WindowSpan::containing(Utc::now(), self.config.window);
        let window_key = self.window_key(key, &span);
        self.cache.delete(&window_key).await?;
        info!(key = %key, strategy = %self.config.strategy, "Rate limit reset");
        Ok(())
    }

    async fn get_limit(&self, key: &str) -> Result<RateLimitResult> {
        let now = Utc::now();
        let span = WindowSpan::containing(now, self.config.window);
        let window_key = self.window_key(key, &span);

        let count = match self.current_count(&window_key).await {
            Ok(count) => count,
            Err(e) => return degrade(&self.config, key, span.end, e),
        };
        let allowed = count < self.config.limit;

        Ok(RateLimitResult {
            allowed,
            limit: self.config.limit,
            remaining: self.config.limit.saturating_sub(count),
            reset_time: span.end,
            retry_after: if allowed {
                Duration::ZERO
            } else {
                span.remaining_from(now)
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
    use crate::ratelimit::test_support::align_to_window;

    fn limiter(limit: u64, window: Duration) -> FixedWindowLimiter {
        let config = RateLimitConfig::default().with_limit(limit).with_window(window);
        FixedWindowLimiter::new(config, Arc::new(MemoryCache::new()))
    }

    #[test]
    fn test_window_span_alignment() {
        let now = DateTime::from_timestamp_millis(125_500).unwrap();
        let span = WindowSpan::containing(now, Duration::from_secs(60));
        assert_eq!(span.start.timestamp_millis(), 120_000);
        assert_eq!(span.end.timestamp_millis(), 180_000);
        assert_eq!(span.remaining_from(now), Duration::from_millis(54_500));
    }

    #[tokio::test]
    async fn test_hundred_requests_per_minute() {
        let limiter = limiter(100, Duration::from_secs(60));
        align_to_window(Duration::from_secs(60), Duration::from_secs(5)).await;

        for expected_remaining in (0..100).rev() {
            let result = limiter.allow("k").await.unwrap();
            assert!(result.allowed);
            assert_eq!(result.remaining, expected_remaining);
            assert_eq!(result.limit, 100);
        }

        let denied = limiter.allow("k").await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
        assert!(denied.retry_after > Duration::ZERO);
    }

    #[tokio::test]
    async fn test_window_boundary_resets_counter() {
        let window = Duration::from_secs(1);
        let limiter = limiter(2, window);
        align_to_window(window, Duration::from_millis(300)).await;

        assert!(limiter.allow("k").await.unwrap().allowed);
        assert!(limiter.allow("k").await.unwrap().allowed);
        let denied = limiter.allow("k").await.unwrap();
        assert!(!denied.allowed);

        tokio::time::sleep(denied.retry_after + Duration::from_millis(20)).await;
        assert!(limiter.allow("k").await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let limiter = limiter(1, Duration::from_secs(60));
        align_to_window(Duration::from_secs(60), Duration::from_secs(5)).await;

        assert!(limiter.allow("a").await.unwrap().allowed);
        assert!(!limiter.allow("a").await.unwrap().allowed);
        assert!(limiter.allow("b").await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_reset_restores_allowance() {
        let limiter = limiter(1, Duration::from_secs(60));
        align_to_window(Duration::from_secs(60), Duration::from_secs(5)).await;

        assert!(limiter.allow("k").await.unwrap().allowed);
        assert!(!limiter.allow("k").await.unwrap().allowed);

        limiter.reset("k").await.unwrap();
        let result = limiter.allow("k").await.unwrap();
        assert!(result.allowed);
        assert_eq!(result.remaining, 0);
    }

    #[tokio::test]
    async fn test_get_limit_does_not_consume() {
        let limiter = limiter(3, Duration::from_secs(60));
        align_to_window(Duration::from_secs(60), Duration::from_secs(5)).await;

        limiter.allow("k").await.unwrap();
        let first = limiter.get_limit("k").await.unwrap();
        let second = limiter.get_limit("k").await.unwrap();
        assert_eq!(first.remaining, 2);
        assert_eq!(second.remaining, 2);
        assert!(second.allowed);
    }

    #[tokio::test]
    async fn test_fail_open_on_cache_error() {
        let config = RateLimitConfig::default().with_limit(5);
        let limiter = FixedWindowLimiter::new(config, Arc::new(FailingCache::new()));

        let result = limiter.allow("k").await.unwrap();
        assert!(result.allowed);
        assert_eq!(result.remaining, 5);
    }

    #[tokio::test]
    async fn test_error_propagates_without_skip() {
        let config = RateLimitConfig::default()
            .with_limit(5)
            .with_skip_on_error(false);
        let limiter = FixedWindowLimiter::new(config, Arc::new(FailingCache::new()));

        let err = limiter.allow("k").await.unwrap_err();
        assert!(err.is_cache());
        assert!(limiter.get_limit("k").await.is_err());
    }

    #[tokio::test]
    async fn test_counter_key_layout() {
        let cache = Arc::new(MemoryCache::new());
        let config = RateLimitConfig::default().with_key_prefix("rl");
        let limiter = FixedWindowLimiter::new(config, cache.clone());

        limiter.allow("ip:1.2.3.4:/api").await.unwrap();
        let keys = cache.keys("rl:ip:1.2.3.4:/api:window:*").await.unwrap();
        assert_eq!(keys.len(), 1);
    }
}
