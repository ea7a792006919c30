//! Token bucket strategy.
//!
//! Each key owns a bucket of at most `burst` tokens. Every `refill_time`
//! adds `refill_rate` tokens; each admitted request takes one. The bucket
//! record lives in the cache as JSON and expires after `2 * refill_time`
//! without traffic.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use super::lock::KeyLock;
use super::types::{chrono_duration, degrade, RateLimitConfig, RateLimitResult, RateLimiter};
use crate::cache::{CacheClient, CacheResult};
use crate::error::Result;

/// Persisted bucket state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenBucket {
    pub tokens: u64,
    pub last_refill: DateTime<Utc>,
}

impl TokenBucket {
    /// A full bucket.
    pub fn full(burst: u64, now: DateTime<Utc>) -> Self {
        Self {
            tokens: burst,
            last_refill: now,
        }
    }

    /// Add the tokens earned since `last_refill`, capped at `burst`.
    ///
    /// `last_refill` only advances by whole refill periods so partial
    /// progress toward the next token is never lost.
    pub fn refill(&mut self, config: &RateLimitConfig, now: DateTime<Utc>) {
        let elapsed = (now - self.last_refill).to_std().unwrap_or(Duration::ZERO);
        let period = config.refill_time.as_nanos().max(1);
        let periods = (elapsed.as_nanos() / period) as u64;
        if periods == 0 {
            return;
        }

        let earned = periods.saturating_mul(config.refill_rate);
        self.tokens = self.tokens.saturating_add(earned).min(config.burst);
        let advance = config
            .refill_time
            .checked_mul(periods.min(u32::MAX as u64) as u32)
            .unwrap_or(elapsed);
        self.last_refill += chrono_duration(advance);
    }

    fn next_refill(&self, config: &RateLimitConfig) -> DateTime<Utc> {
        self.last_refill + chrono_duration(config.refill_time)
    }
}

/// Token bucket rate limiter with cache-resident buckets.
pub struct TokenBucketLimiter {
    config: RateLimitConfig,
    cache: Arc<dyn CacheClient>,
    lock: KeyLock,
}

impl TokenBucketLimiter {
    pub fn new(config: RateLimitConfig, cache: Arc<dyn CacheClient>) -> Self {
        let lock = KeyLock::new(cache.clone());
        Self {
            config,
            cache,
            lock,
        }
    }

    fn bucket_key(&self, key: &str) -> String {
        format!("{}:{}", self.config.key_prefix, key)
    }

    async fn load(&self, bucket_key: &str, now: DateTime<Utc>) -> CacheResult<TokenBucket> {
        match self.cache.get(bucket_key).await? {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(TokenBucket::full(self.config.burst, now)),
        }
    }

    async fn save(&self, bucket_key: &str, bucket: &TokenBucket) -> CacheResult<()> {
        let raw = serde_json::to_string(bucket)?;
        self.cache
            .set(bucket_key, &raw, self.config.refill_time * 2)
            .await
    }

    async fn allow_locked(&self, key: &str, bucket_key: &str, now: DateTime<Utc>) -> Result<RateLimitResult> {
        let mut bucket = match self.load(bucket_key, now).await {
            Ok(bucket) => bucket,
            Err(e) => return degrade(&self.config, key, now + chrono_duration(self.config.refill_time), e),
        };
        bucket.refill(&self.config, now);

        if bucket.tokens == 0 {
            let retry_after = self.config.refill_time;
            warn!(
                key = %key,
                burst = self.config.burst,
                retry_after = ?retry_after,
                "Token bucket is empty"
            );
            return Ok(RateLimitResult {
                allowed: false,
                limit: self.config.burst,
                remaining: 0,
                reset_time: bucket.next_refill(&self.config),
                retry_after,
                strategy: self.config.strategy,
                key: key.to_string(),
            });
        }

        bucket.tokens -= 1;
        if let Err(e) = self.save(bucket_key, &bucket).await {
            return degrade(&self.config, key, bucket.next_refill(&self.config), e);
        }

        debug!(
            key = %key,
            tokens = bucket.tokens,
            burst = self.config.burst,
            "Token bucket check passed"
        );

        Ok(RateLimitResult {
            allowed: true,
            limit: self.config.burst,
            remaining: bucket.tokens,
            reset_time: bucket.next_refill(&self.config),
            retry_after: Duration::ZERO,
            strategy: self.config.strategy,
            key: key.to_string(),
        })
    }
}

#[async_trait]
impl RateLimiter for TokenBucketLimiter {
    async fn allow(&self, key: &str) -> Result<RateLimitResult> {
        let bucket_key = self.bucket_key(key);
        trace!(key = %key, bucket_key = %bucket_key, "Checking token bucket");

        let lock_key = format!("{}:lock", bucket_key);
        let guard = match self.lock.acquire(&lock_key).await {
            Ok(guard) => guard,
            Err(e) => {
                let reset_time = Utc::now() + chrono_duration(self.config.refill_time);
                return degrade(&self.config, key, reset_time, e);
            }
        };

        let result = self.allow_locked(key, &bucket_key, Utc::now()).await;

        if let Some(guard) = guard {
            self.lock.release(guard).await;
        }
        result
    }

    async fn reset(&self, key: &str) -> Result<()> {
        self.cache.delete(&self.bucket_key(key)).await?;
        info!(key = %key, strategy = %self.config.strategy, "Rate limit reset");
        Ok(())
    }

    async fn get_limit(&self, key: &str) -> Result<RateLimitResult> {
        let now = Utc::now();
        let mut bucket = match self.load(&self.bucket_key(key), now).await {
            Ok(bucket) => bucket,
            Err(e) => return degrade(&self.config, key, now + chrono_duration(self.config.refill_time), e),
        };
        bucket.refill(&self.config, now);
        let allowed = bucket.tokens > 0;

        Ok(RateLimitResult {
            allowed,
            limit: self.config.burst,
            remaining: bucket.tokens,
            reset_time: bucket.next_refill(&self.config),
            retry_after: if allowed {
                Duration::ZERO
            } else {
                self.config.refill_time
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
