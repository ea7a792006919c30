//! Per-request quota enforcement with layered policy resolution.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, trace, warn};

use super::client::{principal_key, ClientInfo};
use super::decision::{Decision, HeaderNames};
use crate::config::duration_serde;
use crate::error::{RatewallError, Result};
use crate::ratelimit::{PolicyOverride, RateLimitManager, StrategyKind};

/// Per-path or per-principal adjustments. Unset fields inherit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitOverride {
    #[serde(default)]
    pub strategy: Option<String>,
    #[serde(default)]
    pub limit: Option<u64>,
    #[serde(default, with = "duration_serde::option")]
    pub window: Option<Duration>,
}

/// API protection policy.
///
/// `overrides` is keyed by request path or by `principal:{id}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiProtectionConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Registry id of the strategy used when nothing overrides it
    #[serde(default = "default_strategy")]
    pub default_strategy: String,
    #[serde(default = "default_limit")]
    pub default_limit: u64,
    #[serde(default = "default_window", with = "duration_serde")]
    pub default_window: Duration,
    #[serde(default)]
    pub ip_allowlist: Vec<String>,
    #[serde(default)]
    pub ip_denylist: Vec<String>,
    #[serde(default)]
    pub principal_allowlist: Vec<String>,
    #[serde(default)]
    pub principal_denylist: Vec<String>,
    /// Path prefixes that bypass protection entirely
    #[serde(default = "default_skip_paths")]
    pub skip_paths: Vec<String>,
    #[serde(default)]
    pub overrides: HashMap<String, LimitOverride>,
    #[serde(default = "default_error_message")]
    pub error_message: String,
    #[serde(default = "default_forbidden_message")]
    pub forbidden_message: String,
    #[serde(default)]
    pub headers: HeaderNames,
}

fn default_enabled() -> bool {
    true
}

fn default_strategy() -> String {
    StrategyKind::FixedWindow.as_str().to_string()
}

fn default_limit() -> u64 {
    100
}

fn default_window() -> Duration {
    Duration::from_secs(60)
}

fn default_skip_paths() -> Vec<String> {
    vec!["/health".to_string(), "/metrics".to_string()]
}

fn default_error_message() -> String {
    "Rate limit exceeded. Please retry later.".to_string()
}

fn default_forbidden_message() -> String {
    "Access denied".to_string()
}

impl Default for ApiProtectionConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            default_strategy: default_strategy(),
            default_limit: default_limit(),
            default_window: default_window(),
            ip_allowlist: Vec::new(),
            ip_denylist: Vec::new(),
            principal_allowlist: Vec::new(),
            principal_denylist: Vec::new(),
            skip_paths: default_skip_paths(),
            overrides: HashMap::new(),
            error_message: default_error_message(),
            forbidden_message: default_forbidden_message(),
            headers: HeaderNames::default(),
        }
    }
}

impl ApiProtectionConfig {
    /// Check limits, windows and strategy names without consulting a registry.
    pub fn validate(&self) -> Result<()> {
        if self.default_limit == 0 {
            return Err(RatewallError::Config(
                "api_protection.default_limit must be greater than zero".to_string(),
            ));
        }
        if self.default_window.is_zero() {
            return Err(RatewallError::Config(
                "api_protection.default_window must be greater than zero".to_string(),
            ));
        }
        for (key, o) in &self.overrides {
            if o.limit == Some(0) {
                return Err(RatewallError::Config(format!(
                    "override '{}': limit must be greater than zero",
                    key
                )));
            }
            if o.window.is_some_and(|w| w.is_zero()) {
                return Err(RatewallError::Config(format!(
                    "override '{}': window must be greater than zero",
                    key
                )));
            }
        }
        for name in self.strategy_names() {
            name.parse::<StrategyKind>()?;
        }
        Ok(())
    }

    /// Every strategy id this policy can resolve to.
    fn strategy_names(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.default_strategy.as_str())
            .chain(self.overrides.values().filter_map(|o| o.strategy.as_deref()))
    }
}

/// The effective policy for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPolicy {
    pub strategy: String,
    pub limit: u64,
    pub window: Duration,
}

impl ResolvedPolicy {
    fn layer(&mut self, o: &LimitOverride) {
        if let Some(ref strategy) = o.strategy {
            self.strategy = strategy.clone();
        }
        if let Some(limit) = o.limit {
            self.limit = limit;
        }
        if let Some(window) = o.window {
            self.window = window;
        }
    }
}

/// Read-optimised view of [`ApiProtectionConfig`].
struct PolicySnapshot {
    config: ApiProtectionConfig,
    ip_allow: HashSet<String>,
    ip_deny: HashSet<String>,
    principal_allow: HashSet<String>,
    principal_deny: HashSet<String>,
}

impl PolicySnapshot {
    fn new(config: ApiProtectionConfig) -> Self {
        let set = |v: &[String]| v.iter().cloned().collect::<HashSet<_>>();
        Self {
            ip_allow: set(&config.ip_allowlist),
            ip_deny: set(&config.ip_denylist),
            principal_allow: set(&config.principal_allowlist),
            principal_deny: set(&config.principal_denylist),
            config,
        }
    }
}

/// Resolves and enforces quotas for each request.
///
/// The policy is an immutable snapshot; [`ApiProtector::update_policy`]
/// publishes a replacement atomically while requests keep flowing.
pub struct ApiProtector {
    policy: ArcSwap<PolicySnapshot>,
    manager: Arc<RateLimitManager>,
}

impl ApiProtector {
    /// Create a protector. Fails if the policy references an unregistered strategy.
    pub fn new(config: ApiProtectionConfig, manager: Arc<RateLimitManager>) -> Result<Self> {
        Self::check(&config, &manager)?;
        Ok(Self {
            policy: ArcSwap::from_pointee(PolicySnapshot::new(config)),
            manager,
        })
    }

    fn check(config: &ApiProtectionConfig, manager: &RateLimitManager) -> Result<()> {
        config.validate()?;
        for name in config.strategy_names() {
            if !manager.is_registered(name) {
                return Err(RatewallError::UnregisteredStrategy(name.to_string()));
            }
        }
        Ok(())
    }

    /// Replace the policy. In-flight requests finish on the old snapshot.
    pub fn update_policy(&self, config: ApiProtectionConfig) -> Result<()> {
        Self::check(&config, &self.manager)?;
        self.policy.store(Arc::new(PolicySnapshot::new(config)));
        debug!("API protection policy updated");
        Ok(())
    }

    /// The current policy.
    pub fn policy(&self) -> ApiProtectionConfig {
        self.policy.load().config.clone()
    }

    pub fn manager(&self) -> &Arc<RateLimitManager> {
        &self.manager
    }

    /// Whether `path` falls under a skip-listed prefix.
    pub fn should_skip(&self, path: &str) -> bool {
        Self::skips(&self.policy.load(), path)
    }

    fn skips(snapshot: &PolicySnapshot, path: &str) -> bool {
        snapshot
            .config
            .skip_paths
            .iter()
            .any(|p| path.starts_with(p.as_str()))
    }

    fn is_denied(snapshot: &PolicySnapshot, client: &ClientInfo) -> bool {
        snapshot.ip_deny.contains(&client.ip) || snapshot.principal_deny.contains(&client.principal)
    }

    fn is_allowed(snapshot: &PolicySnapshot, client: &ClientInfo) -> bool {
        snapshot.ip_allow.contains(&client.ip)
            || snapshot.principal_allow.contains(&client.principal)
    }

    /// Effective policy: default, then the path override, then the principal
    /// override. Later layers win.
    pub fn resolve_policy(&self, client: &ClientInfo) -> ResolvedPolicy {
        Self::resolve(&self.policy.load(), client)
    }

    fn resolve(snapshot: &PolicySnapshot, client: &ClientInfo) -> ResolvedPolicy {
        let config = &snapshot.config;
        let mut policy = ResolvedPolicy {
            strategy: config.default_strategy.clone(),
            limit: config.default_limit,
            window: config.default_window,
        };
        if let Some(o) = config.overrides.get(&client.path) {
            policy.layer(o);
        }
        if let Some(o) = config.overrides.get(&principal_key(&client.principal)) {
            policy.layer(o);
        }
        policy
    }

    /// Decide what to do with a request.
    ///
    /// Store failures are logged and admitted. Only configuration errors
    /// (an unregistered strategy or an invalid resolved policy) come back as `Err`.
    pub async fn check_request(&self, client: &ClientInfo) -> Result<Decision> {
        let snapshot = self.policy.load_full();
        let config = &snapshot.config;

        if !config.enabled || Self::skips(&snapshot, &client.path) {
            trace!(path = %client.path, "API protection skipped");
            return Ok(Decision::pass());
        }

        if Self::is_denied(&snapshot, client) {
            warn!(
                ip = %client.ip,
                principal = %client.principal,
                path = %client.path,
                "Request from deny-listed client"
            );
            return Ok(Decision::forbidden(config.forbidden_message.clone()));
        }

        if Self::is_allowed(&snapshot, client) {
            debug!(
                ip = %client.ip,
                principal = %client.principal,
                path = %client.path,
                "Request from allow-listed client"
            );
            return Ok(Decision::pass());
        }

        let policy = Self::resolve(&snapshot, client);
        let key = client.admission_key();
        let overrides = PolicyOverride {
            limit: Some(policy.limit),
            window: Some(policy.window),
        };

        let result = match self.manager.allow_with(&policy.strategy, &overrides, &key).await {
            Ok(result) => result,
            Err(e) if e.is_cache() => {
                error!(
                    key = %key,
                    strategy = %policy.strategy,
                    error = %e,
                    "Rate limit check failed, admitting request"
                );
                return Ok(Decision::pass());
            }
            Err(e) => {
                error!(key = %key, strategy = %policy.strategy, error = %e, "Rate limit misconfigured");
                return Err(e);
            }
        };

        let headers = config.headers.render(&result);
        if !result.allowed {
            warn!(
                key = %key,
                strategy = %policy.strategy,
                limit = result.limit,
                retry_after = ?result.retry_after,
                "Rate limit exceeded"
            );
            return Ok(Decision::too_many_requests(
                config.error_message.clone(),
                result.retry_after_secs(),
                headers,
            ));
        }

        debug!(
            key = %key,
            strategy = %policy.strategy,
            limit = result.limit,
            remaining = result.remaining,
            "Rate limit check passed"
        );
        Ok(Decision::Continue { headers })
    }
}
