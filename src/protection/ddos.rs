//! Address-level flood detection.
//!
//! Every address gets two fixed-window counters, one per minute and one per
//! second. Breaching either is treated as an attack: the request is rejected
//! and, with `auto_block`, the address is blocked for `block_duration`.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{error, trace, warn};

use super::blocklist::Blocklist;
use super::decision::Decision;
use crate::config::duration_serde;
use crate::error::{RatewallError, Result};
use crate::ratelimit::{PolicyOverride, RateLimitManager, RateLimitResult, StrategyKind};

const PER_MINUTE: Duration = Duration::from_secs(60);
const PER_SECOND: Duration = Duration::from_secs(1);

/// DDoS protection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DdosProtectionConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_max_requests_per_min")]
    pub max_requests_per_min: u64,
    #[serde(default = "default_max_requests_per_sec")]
    pub max_requests_per_sec: u64,
    /// How long an auto-blocked address stays blocked
    #[serde(default = "default_block_duration", with = "duration_serde")]
    pub block_duration: Duration,
    /// Addresses that are never checked
    #[serde(default)]
    pub allowlist: Vec<String>,
    /// Addresses that are always rejected
    #[serde(default)]
    pub denylist: Vec<String>,
    #[serde(default = "default_auto_block")]
    pub auto_block: bool,
    /// Per-minute request count that raises an alert; zero disables it.
    /// Must not exceed `max_requests_per_min`.
    #[serde(default = "default_alert_threshold")]
    pub alert_threshold: u64,
    #[serde(default = "default_error_message")]
    pub error_message: String,
    #[serde(default = "default_forbidden_message")]
    pub forbidden_message: String,
}

fn default_enabled() -> bool {
    true
}

fn default_max_requests_per_min() -> u64 {
    1000
}

fn default_max_requests_per_sec() -> u64 {
    100
}

fn default_block_duration() -> Duration {
    Duration::from_secs(300)
}

fn default_auto_block() -> bool {
    true
}

fn default_alert_threshold() -> u64 {
    500
}

fn default_error_message() -> String {
    "Too many requests from this address".to_string()
}

fn default_forbidden_message() -> String {
    "Access denied".to_string()
}

impl Default for DdosProtectionConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            max_requests_per_min: default_max_requests_per_min(),
            max_requests_per_sec: default_max_requests_per_sec(),
            block_duration: default_block_duration(),
            allowlist: Vec::new(),
            denylist: Vec::new(),
            auto_block: default_auto_block(),
            alert_threshold: default_alert_threshold(),
            error_message: default_error_message(),
            forbidden_message: default_forbidden_message(),
        }
    }
}

impl DdosProtectionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_requests_per_min == 0 || self.max_requests_per_sec == 0 {
            return Err(RatewallError::Config(
                "ddos_protection ceilings must be greater than zero".to_string(),
            ));
        }
        if self.auto_block && self.block_duration.is_zero() {
            return Err(RatewallError::Config(
                "ddos_protection.block_duration must be greater than zero when auto_block is on"
                    .to_string(),
            ));
        }
        if self.alert_threshold > self.max_requests_per_min {
            return Err(RatewallError::Config(format!(
                "ddos_protection.alert_threshold ({}) exceeds max_requests_per_min ({}) and would never fire",
                self.alert_threshold, self.max_requests_per_min
            )));
        }
        Ok(())
    }
}

/// Per-address dual-window flood check.
pub struct DdosProtector {
    config: DdosProtectionConfig,
    allowlist: HashSet<String>,
    blocklist: Blocklist,
    manager: Arc<RateLimitManager>,
}

impl DdosProtector {
    /// Create a protector on top of the manager's `fixed_window` registration.
    pub fn new(config: DdosProtectionConfig, manager: Arc<RateLimitManager>) -> Result<Self> {
        config.validate()?;
        let strategy = manager.limiter(StrategyKind::FixedWindow.as_str())?.config().strategy;
        if strategy != StrategyKind::FixedWindow {
            return Err(RatewallError::Config(format!(
                "'{}' is registered as {}, DDoS protection needs a fixed window",
                StrategyKind::FixedWindow,
                strategy
            )));
        }

        let blocklist = Blocklist::new(
            manager.cache().clone(),
            config.denylist.iter().cloned(),
            config.block_duration,
        );
        Ok(Self {
            allowlist: config.allowlist.iter().cloned().collect(),
            config,
            blocklist,
            manager,
        })
    }

    pub fn config(&self) -> &DdosProtectionConfig {
        &self.config
    }

    pub fn blocklist(&self) -> &Blocklist {
        &self.blocklist
    }

    /// Decide what to do with a request from `ip`. Never fails: store
    /// errors admit the request.
    pub async fn check(&self, ip: &str) -> Decision {
        if !self.config.enabled || self.allowlist.contains(ip) {
            return Decision::pass();
        }

        if self.blocklist.is_blocked(ip).await {
            warn!(ip = %ip, "Request from blocked address");
            return Decision::forbidden(self.config.forbidden_message.clone());
        }

        let per_min = PolicyOverride {
            limit: Some(self.config.max_requests_per_min),
            window: Some(PER_MINUTE),
        };
        let per_sec = PolicyOverride {
            limit: Some(self.config.max_requests_per_sec),
            window: Some(PER_SECOND),
        };
        let min_key = format!("ddos:min:{}", ip);
        let sec_key = format!("ddos:sec:{}", ip);

        let strategy = StrategyKind::FixedWindow.as_str();
        let (min_result, sec_result) = futures::future::join(
            self.manager.allow_with(strategy, &per_min, &min_key),
            self.manager.allow_with(strategy, &per_sec, &sec_key),
        )
        .await;

        let (min_result, sec_result) = match (min_result, sec_result) {
            (Ok(m), Ok(s)) => (m, s),
            (Err(e), _) | (_, Err(e)) => {
                error!(ip = %ip, error = %e, "DDoS check failed, admitting request");
                return Decision::pass();
            }
        };

        let used_per_min = used(&min_result);
        if self.config.alert_threshold > 0 && used_per_min == self.config.alert_threshold {
            error!(
                ip = %ip,
                requests = used_per_min,
                threshold = self.config.alert_threshold,
                "Address reached DDoS alert threshold"
            );
        }

        if min_result.allowed && sec_result.allowed {
            trace!(ip = %ip, per_min = used_per_min, "DDoS check passed");
            return Decision::pass();
        }

        error!(
            ip = %ip,
            min_requests = used_per_min,
            sec_requests = used(&sec_result),
            max_per_min = self.config.max_requests_per_min,
            max_per_sec = self.config.max_requests_per_sec,
            "DDoS attack detected"
        );

        if self.config.auto_block {
            if let Err(e) = self.blocklist.block(ip).await {
                warn!(ip = %ip, error = %e, "Failed to share block, holding it locally");
            }
        }

        let retry_after = [&min_result, &sec_result]
            .iter()
            .filter(|r| !r.allowed)
            .map(|r| r.retry_after_secs())
            .max()
            .unwrap_or(1);
        Decision::too_many_requests(
            self.config.error_message.clone(),
            retry_after,
            vec![("Retry-After".to_string(), retry_after.to_string())],
        )
    }
}

/// Requests counted in the window a result came from.
fn used(result: &RateLimitResult) -> u64 {
    if result.allowed {
        result.limit.saturating_sub(result.remaining)
    } else {
        result.limit
    }
}
