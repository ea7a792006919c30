//! The protector graph, and an optional process-wide handle to it.
//!
//! Components take explicit `Arc` dependencies; the global slot exists only
//! so top-level wiring code can reach the graph without threading it through.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::api::ApiProtector;
use super::ddos::DdosProtector;
use super::headers::SecurityHeaders;
use crate::cache::CacheClient;
use crate::config::RatewallConfig;
use crate::error::Result;
use crate::ratelimit::RateLimitManager;

/// One manager and the protectors that share it.
pub struct Protection {
    pub manager: Arc<RateLimitManager>,
    pub api: ApiProtector,
    pub ddos: DdosProtector,
    pub headers: SecurityHeaders,
    /// Peers allowed to report the client address through forwarding headers.
    pub trusted_proxies: HashSet<IpAddr>,
}

impl Protection {
    /// Build the whole graph over a single cache client.
    pub fn from_config(cache: Arc<dyn CacheClient>, config: &RatewallConfig) -> Result<Self> {
        let manager = Arc::new(RateLimitManager::with_defaults(cache, &config.rate_limiting)?);
        let api = ApiProtector::new(config.api_protection.clone(), manager.clone())?;
        let ddos = DdosProtector::new(config.ddos_protection.clone(), manager.clone())?;
        let headers = SecurityHeaders::new(&config.security_headers);

        info!(
            strategies = ?manager.strategy_ids(),
            api_enabled = config.api_protection.enabled,
            ddos_enabled = config.ddos_protection.enabled,
            trusted_proxies = config.server.trusted_proxies.len(),
            "Protection initialized"
        );
        Ok(Self {
            manager,
            api,
            ddos,
            headers,
            trusted_proxies: config.server.trusted_proxies.iter().copied().collect(),
        })
    }

    /// Drop expired cache entries and lapsed local blocks. Returns how many
    /// were removed.
    pub fn purge_expired(&self) -> usize {
        self.manager.cache().purge_expired() + self.ddos.blocklist().purge_expired()
    }

    /// Run [`purge_expired`](Self::purge_expired) every `every` until the
    /// returned task is aborted.
    pub fn spawn_sweeper(self: Arc<Self>, every: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(every).await;
                let removed = self.purge_expired();
                if removed > 0 {
                    debug!(removed, "Purged expired entries");
                }
            }
        })
    }
}

static GLOBAL: OnceLock<Arc<Protection>> = OnceLock::new();

/// Publish `protection` as the process-wide instance. Only the first call wins.
pub fn install_global(protection: Arc<Protection>) -> bool {
    let installed = GLOBAL.set(protection).is_ok();
    if !installed {
        warn!("Global protection already installed, keeping the existing instance");
    }
    installed
}

/// The process-wide instance, if one was installed.
pub fn global() -> Option<Arc<Protection>> {
    GLOBAL.get().cloned()
}
