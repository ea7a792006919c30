//! Registry of configured rate limiters.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use super::fixed_window::FixedWindowLimiter;
use super::sliding_window::SlidingWindowLimiter;
use super::token_bucket::TokenBucketLimiter;
use super::types::{RateLimitConfig, RateLimitResult, RateLimiter, StrategyKind};
use crate::cache::CacheClient;
use crate::error::{RatewallError, Result};

/// Per-call adjustments applied on top of a registered policy.
///
/// For the window strategies `limit` and `window` replace their namesakes.
/// For the token bucket `limit` sets the burst; its refill schedule is kept.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PolicyOverride {
    pub limit: Option<u64>,
    pub window: Option<Duration>,
}

impl PolicyOverride {
    pub fn is_empty(&self) -> bool {
        self.limit.is_none() && self.window.is_none()
    }

    /// The policy `base` becomes under this override.
    pub fn apply(&self, base: &RateLimitConfig) -> RateLimitConfig {
        let mut config = base.clone();
        match config.strategy {
            StrategyKind::TokenBucket => {
                if let Some(limit) = self.limit {
                    config.burst = limit;
                }
            }
            StrategyKind::FixedWindow | StrategyKind::SlidingWindow => {
                if let Some(limit) = self.limit {
                    config.limit = limit;
                }
                if let Some(window) = self.window {
                    config.window = window;
                }
            }
        }
        config
    }
}

/// Maps strategy identifiers to limiter instances sharing one cache client.
///
/// Populate it at startup, then share it behind an `Arc`; lookups take no
/// locks.
pub struct RateLimitManager {
    limiters: HashMap<String, Arc<dyn RateLimiter>>,
    cache: Arc<dyn CacheClient>,
}

impl RateLimitManager {
    /// Create an empty registry.
    pub fn new(cache: Arc<dyn CacheClient>) -> Self {
        Self {
            limiters: HashMap::new(),
            cache,
        }
    }

    /// Create a registry with every strategy registered under its canonical
    /// name, each derived from `base` and namespaced under
    /// `{base.key_prefix}:{strategy}`.
    pub fn with_defaults(cache: Arc<dyn CacheClient>, base: &RateLimitConfig) -> Result<Self> {
        let mut manager = Self::new(cache);
        for kind in StrategyKind::ALL {
            let config = RateLimitConfig {
                strategy: kind,
                key_prefix: format!("{}:{}", base.key_prefix, kind),
                ..base.clone()
            };
            manager.register_limiter(kind.as_str(), config)?;
        }
        Ok(manager)
    }

    /// Build the limiter matching `config.strategy`.
    pub fn build_limiter(config: RateLimitConfig, cache: Arc<dyn CacheClient>) -> Arc<dyn RateLimiter> {
        match config.strategy {
            StrategyKind::FixedWindow => Arc::new(FixedWindowLimiter::new(config, cache)),
            StrategyKind::SlidingWindow => Arc::new(SlidingWindowLimiter::new(config, cache)),
            StrategyKind::TokenBucket => Arc::new(TokenBucketLimiter::new(config, cache)),
        }
    }

    /// Register (or replace) the limiter for `id`. Invalid policies are rejected.
    pub fn register_limiter(&mut self, id: impl Into<String>, config: RateLimitConfig) -> Result<()> {
        let id = id.into();
        config.validate()?;

        info!(
            id = %id,
            strategy = %config.strategy,
            limit = config.capacity(),
            "Registering rate limiter"
        );
        let limiter = Self::build_limiter(config, self.cache.clone());
        self.limiters.insert(id, limiter);
        Ok(())
    }

    /// Look up a registered limiter.
    pub fn limiter(&self, id: &str) -> Result<&Arc<dyn RateLimiter>> {
        self.limiters
            .get(id)
            .ok_or_else(|| RatewallError::UnregisteredStrategy(id.to_string()))
    }

    pub fn is_registered(&self, id: &str) -> bool {
        self.limiters.contains_key(id)
    }

    /// Registered identifiers, sorted.
    pub fn strategy_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.limiters.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// The shared cache client.
    pub fn cache(&self) -> &Arc<dyn CacheClient> {
        &self.cache
    }

    pub async fn allow(&self, id: &str, key: &str) -> Result<RateLimitResult> {
        self.limiter(id)?.allow(key).await
    }

    pub async fn reset(&self, id: &str, key: &str) -> Result<()> {
        self.limiter(id)?.reset(key).await
    }

    pub async fn get_limit(&self, id: &str, key: &str) -> Result<RateLimitResult> {
        self.limiter(id)?.get_limit(key).await
    }

    /// Like [`allow`](Self::allow), enforcing the registered policy adjusted
    /// by `overrides`. The registered limiter itself is left untouched.
    pub async fn allow_with(
        &self,
        id: &str,
        overrides: &PolicyOverride,
        key: &str,
    ) -> Result<RateLimitResult> {
        let limiter = self.limiter(id)?;
        if overrides.is_empty() {
            return limiter.allow(key).await;
        }

        let config = overrides.apply(limiter.config());
        if &config == limiter.config() {
            return limiter.allow(key).await;
        }
        config.validate()?;

        debug!(
            id = %id,
            key = %key,
            limit = config.capacity(),
            "Applying policy override"
        );
        limiter.with_config(config).allow(key).await
    }
}
