//! Shared rate limiting types: policy, outcome, and the strategy contract.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::cache::CacheError;
use crate::config::duration_serde;
use crate::error::{RatewallError, Result};

/// The available rate limiting algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    FixedWindow,
    SlidingWindow,
    TokenBucket,
}

impl StrategyKind {
    /// All strategies, in registration order.
    pub const ALL: [StrategyKind; 3] = [
        StrategyKind::FixedWindow,
        StrategyKind::SlidingWindow,
        StrategyKind::TokenBucket,
    ];

    /// Canonical identifier, also used as the default registry id.
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::FixedWindow => "fixed_window",
            StrategyKind::SlidingWindow => "sliding_window",
            StrategyKind::TokenBucket => "token_bucket",
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StrategyKind {
    type Err = RatewallError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "fixed_window" => Ok(StrategyKind::FixedWindow),
            "sliding_window" => Ok(StrategyKind::SlidingWindow),
            "token_bucket" => Ok(StrategyKind::TokenBucket),
            other => Err(RatewallError::Config(format!(
                "unknown rate limit strategy '{}'",
                other
            ))),
        }
    }
}

/// Immutable rate limit policy.
///
/// `limit` and `window` drive the window strategies; `burst`, `refill_rate`
/// and `refill_time` drive the token bucket. A new config replaces an old
/// one, it is never edited in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_strategy")]
    pub strategy: StrategyKind,
    #[serde(default = "default_limit")]
    pub limit: u64,
    #[serde(default = "default_window", with = "duration_serde")]
    pub window: Duration,
    #[serde(default = "default_burst")]
    pub burst: u64,
    #[serde(default = "default_refill_rate")]
    pub refill_rate: u64,
    #[serde(default = "default_refill_time", with = "duration_serde")]
    pub refill_time: Duration,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    /// Fail open when the cache is unavailable.
    #[serde(default = "default_skip_on_error")]
    pub skip_on_error: bool,
}

fn default_strategy() -> StrategyKind {
    StrategyKind::FixedWindow
}

fn default_limit() -> u64 {
    100
}

fn default_window() -> Duration {
    Duration::from_secs(60)
}

fn default_burst() -> u64 {
    10
}

fn default_refill_rate() -> u64 {
    10
}

fn default_refill_time() -> Duration {
    Duration::from_secs(1)
}

fn default_key_prefix() -> String {
    "rate_limit".to_string()
}

fn default_skip_on_error() -> bool {
    true
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            strategy: default_strategy(),
            limit: default_limit(),
            window: default_window(),
            burst: default_burst(),
            refill_rate: default_refill_rate(),
            refill_time: default_refill_time(),
            key_prefix: default_key_prefix(),
            skip_on_error: default_skip_on_error(),
        }
    }
}

impl RateLimitConfig {
    /// Default policy for a given strategy.
    pub fn for_strategy(strategy: StrategyKind) -> Self {
        Self {
            strategy,
            ..Self::default()
        }
    }

    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    pub fn with_burst(mut self, burst: u64) -> Self {
        self.burst = burst;
        self
    }

    pub fn with_refill(mut self, rate: u64, every: Duration) -> Self {
        self.refill_rate = rate;
        self.refill_time = every;
        self
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn with_skip_on_error(mut self, skip: bool) -> Self {
        self.skip_on_error = skip;
        self
    }

    /// Check the numeric invariants of the policy for its strategy.
    pub fn validate(&self) -> Result<()> {
        let invalid = |what: &str| {
            Err(RatewallError::Config(format!(
                "invalid {} policy: {}",
                self.strategy, what
            )))
        };

        match self.strategy {
            StrategyKind::FixedWindow | StrategyKind::SlidingWindow => {
                if self.limit == 0 {
                    return invalid("limit must be greater than zero");
                }
                if self.window.is_zero() {
                    return invalid("window must be greater than zero");
                }
            }
            StrategyKind::TokenBucket => {
                if self.burst == 0 {
                    return invalid("burst must be greater than zero");
                }
                if self.refill_rate == 0 {
                    return invalid("refill_rate must be greater than zero");
                }
                if self.refill_time.is_zero() {
                    return invalid("refill_time must be greater than zero");
                }
            }
        }

        if self.key_prefix.is_empty() {
            return invalid("key_prefix must not be empty");
        }
        Ok(())
    }

    /// The maximum number of permits this policy reports as its limit.
    pub fn capacity(&self) -> u64 {
        match self.strategy {
            StrategyKind::TokenBucket => self.burst,
            _ => self.limit,
        }
    }
}

/// Outcome of one admission check.
///
/// A denial is not an error: `allowed` is false and `retry_after` says how
/// long the caller should wait.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimitResult {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    pub reset_time: DateTime<Utc>,
    #[serde(with = "duration_serde")]
    pub retry_after: Duration,
    pub strategy: StrategyKind,
    pub key: String,
}

impl RateLimitResult {
    /// The fail-open result: admitted with the full allowance remaining.
    pub fn fail_open(config: &RateLimitConfig, key: &str, reset_time: DateTime<Utc>) -> Self {
        Self {
            allowed: true,
            limit: config.capacity(),
            remaining: config.capacity(),
            reset_time,
            retry_after: Duration::ZERO,
            strategy: config.strategy,
            key: key.to_string(),
        }
    }

    /// Whole seconds to wait before retrying, rounded up.
    pub fn retry_after_secs(&self) -> u64 {
        let secs = self.retry_after.as_secs();
        if self.retry_after.subsec_nanos() > 0 {
            secs + 1
        } else {
            secs
        }
    }
}

/// The contract every strategy implements.
///
/// `key` is already scoped by the caller (principal or address plus path).
/// An `Err` signals a store failure that the policy did not absorb, never a
/// denial.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Consume one permit if available.
    async fn allow(&self, key: &str) -> Result<RateLimitResult>;

    /// Forget all state for `key`.
    async fn reset(&self, key: &str) -> Result<()>;

    /// Report current state for `key` without consuming a permit.
    async fn get_limit(&self, key: &str) -> Result<RateLimitResult>;

    /// The policy this limiter enforces.
    fn config(&self) -> &RateLimitConfig;

    /// A limiter of the same kind, sharing the same store, enforcing `config`.
    fn with_config(&self, config: RateLimitConfig) -> Arc<dyn RateLimiter>;
}

/// Apply the policy's failure mode to a store error.
///
/// With `skip_on_error` the request is admitted with the full allowance and
/// the error only logged; otherwise the error goes back to the caller.
pub(crate) fn degrade(
    config: &RateLimitConfig,
    key: &str,
    reset_time: DateTime<Utc>,
    err: CacheError,
) -> Result<RateLimitResult> {
    if config.skip_on_error {
        warn!(
            key = %key,
            strategy = %config.strategy,
            error = %err,
            "Rate limit store unavailable, failing open"
        );
        Ok(RateLimitResult::fail_open(config, key, reset_time))
    } else {
        error!(
            key = %key,
            strategy = %config.strategy,
            error = %err,
            "Rate limit store unavailable"
        );
        Err(err.into())
    }
}

/// Convert a duration to a signed chrono duration, saturating on overflow.
pub(crate) fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}
