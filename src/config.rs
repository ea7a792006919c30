//! Configuration management for Ratewall.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{RatewallError, Result};
use crate::protection::{ApiProtectionConfig, DdosProtectionConfig, SecurityHeadersConfig};
use crate::ratelimit::RateLimitConfig;

/// Environment variable prefix; nested keys are separated by `__`,
/// e.g. `RATEWALL__CACHE__BACKEND=memory`.
const ENV_PREFIX: &str = "RATEWALL";

/// Main configuration for the Ratewall service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RatewallConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Shared cache configuration
    #[serde(default)]
    pub cache: CacheConfig,

    /// Base policy the default strategies are registered with
    #[serde(default)]
    pub rate_limiting: RateLimitConfig,

    /// Per-request quota enforcement
    #[serde(default)]
    pub api_protection: ApiProtectionConfig,

    /// Address-level flood detection
    #[serde(default)]
    pub ddos_protection: DdosProtectionConfig,

    /// Static response hardening headers
    #[serde(default)]
    pub security_headers: SecurityHeadersConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Peer addresses whose `X-Forwarded-For` and `X-Real-IP` headers are
    /// believed. Requests from any other peer are keyed by the peer address.
    #[serde(default)]
    pub trusted_proxies: Vec<IpAddr>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            trusted_proxies: Vec::new(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

/// Which store holds quota state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    Memory,
    Redis,
}

/// Shared cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_backend")]
    pub backend: CacheBackend,

    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Deadline for every individual cache call
    #[serde(default = "default_operation_timeout", with = "duration_serde")]
    pub operation_timeout: Duration,

    /// How often expired entries held in process are swept
    #[serde(default = "default_sweep_interval", with = "duration_serde")]
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: default_cache_backend(),
            redis_url: default_redis_url(),
            operation_timeout: default_operation_timeout(),
            sweep_interval: default_sweep_interval(),
        }
    }
}

fn default_cache_backend() -> CacheBackend {
    CacheBackend::Redis
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_operation_timeout() -> Duration {
    Duration::from_millis(100)
}

fn default_sweep_interval() -> Duration {
    Duration::from_secs(60)
}

impl RatewallConfig {
    /// Load configuration from an optional YAML file, overlaid with
    /// `RATEWALL__*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(
                config::File::from(path).format(config::FileFormat::Yaml),
            );
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("api_protection.skip_paths")
                .with_list_parse_key("api_protection.ip_allowlist")
                .with_list_parse_key("api_protection.ip_denylist")
                .with_list_parse_key("api_protection.principal_allowlist")
                .with_list_parse_key("api_protection.principal_denylist")
                .with_list_parse_key("ddos_protection.allowlist")
                .with_list_parse_key("ddos_protection.denylist")
                .with_list_parse_key("server.trusted_proxies")
                .try_parsing(true),
        );

        let config: RatewallConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| RatewallError::Config(format!("Failed to load configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: RatewallConfig = serde_yaml::from_str(yaml)
            .map_err(|e| RatewallError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject invalid numeric policy and malformed overrides up front.
    pub fn validate(&self) -> Result<()> {
        self.rate_limiting.validate()?;
        self.api_protection.validate()?;
        self.ddos_protection.validate()?;
        if self.cache.operation_timeout.is_zero() {
            return Err(RatewallError::Config(
                "cache.operation_timeout must be greater than zero".to_string(),
            ));
        }
        if self.cache.sweep_interval.is_zero() {
            return Err(RatewallError::Config(
                "cache.sweep_interval must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Parse a duration such as `250ms`, `30s`, `5m`, `1h` or a bare number of seconds.
pub fn parse_duration(value: &str) -> std::result::Result<Duration, String> {
    let value = value.trim();
    let split = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    let (number, unit) = value.split_at(split);
    let amount: u64 = number
        .parse()
        .map_err(|_| format!("invalid duration '{}'", value))?;

    match unit.trim() {
        "" | "s" => Ok(Duration::from_secs(amount)),
        "ms" => Ok(Duration::from_millis(amount)),
        "m" => Ok(Duration::from_secs(amount * 60)),
        "h" => Ok(Duration::from_secs(amount * 3600)),
        other => Err(format!("invalid duration unit '{}' in '{}'", other, value)),
    }
}

/// Render a duration in the shortest exact unit `parse_duration` accepts.
pub fn format_duration(d: Duration) -> String {
    let millis = d.as_millis();
    if millis % 1000 != 0 {
        return format!("{}ms", millis);
    }
    let secs = d.as_secs();
    if secs != 0 && secs % 3600 == 0 {
        format!("{}h", secs / 3600)
    } else if secs != 0 && secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{}s", secs)
    }
}

/// Serde adapter for durations written as seconds or suffixed strings.
pub mod duration_serde {
    use super::{format_duration, parse_duration};
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Secs(u64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        match Raw::deserialize(d)? {
            Raw::Secs(secs) => Ok(Duration::from_secs(secs)),
            Raw::Text(text) => parse_duration(&text).map_err(serde::de::Error::custom),
        }
    }

    /// Same as the parent module for `Option<Duration>`.
    pub mod option {
        use super::*;
        use serde::Serialize;

        pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
            d.map(format_duration).serialize(s)
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
            match Option::<Raw>::deserialize(d)? {
                None => Ok(None),
                Some(Raw::Secs(secs)) => Ok(Some(Duration::from_secs(secs))),
                Some(Raw::Text(text)) => parse_duration(&text)
                    .map(Some)
                    .map_err(serde::de::Error::custom),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::StrategyKind;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("42").unwrap(), Duration::from_secs(42));
        assert!(parse_duration("5 days").is_err());
        assert!(parse_duration("m").is_err());
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_millis(1500)), "1500ms");
        assert_eq!(format_duration(Duration::from_secs(60)), "1m");
        assert_eq!(format_duration(Duration::from_secs(7200)), "2h");
        assert_eq!(format_duration(Duration::from_secs(45)), "45s");
        assert_eq!(format_duration(Duration::ZERO), "0s");
    }

    #[test]
    fn test_default_config() {
        let config = RatewallConfig::default();
        assert_eq!(config.server.listen_addr.port(), 8080);
        assert_eq!(config.cache.backend, CacheBackend::Redis);
        assert_eq!(config.cache.operation_timeout, Duration::from_millis(100));
        assert_eq!(config.cache.sweep_interval, Duration::from_secs(60));
        assert!(config.server.trusted_proxies.is_empty());
        assert_eq!(config.api_protection.skip_paths, vec!["/health", "/metrics"]);
        assert_eq!(config.ddos_protection.max_requests_per_min, 1000);
        config.validate().unwrap();
    }

    #[test]
    fn test_from_yaml() {
        let yaml = r#"
server:
  trusted_proxies: ["10.0.0.254", "::1"]
cache:
  backend: memory
  operation_timeout: 50ms
  sweep_interval: 5m
rate_limiting:
  strategy: sliding_window
  limit: 20
  window: 10s
api_protection:
  default_strategy: token_bucket
  default_limit: 5
  overrides:
    /api/upload:
      limit: 2
      window: 1m
    principal:admin:
      strategy: fixed_window
ddos_protection:
  max_requests_per_sec: 20
  auto_block: false
"#;
        let config = RatewallConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.cache.backend, CacheBackend::Memory);
        assert_eq!(config.cache.operation_timeout, Duration::from_millis(50));
        assert_eq!(config.cache.sweep_interval, Duration::from_secs(300));
        assert_eq!(config.server.trusted_proxies.len(), 2);
        assert_eq!(config.rate_limiting.strategy, StrategyKind::SlidingWindow);
        assert_eq!(config.rate_limiting.window, Duration::from_secs(10));
        assert_eq!(config.api_protection.default_strategy, "token_bucket");
        let upload = &config.api_protection.overrides["/api/upload"];
        assert_eq!(upload.limit, Some(2));
        assert_eq!(upload.window, Some(Duration::from_secs(60)));
        assert_eq!(
            config.api_protection.overrides["principal:admin"].strategy.as_deref(),
            Some("fixed_window")
        );
        assert_eq!(config.ddos_protection.max_requests_per_sec, 20);
        assert!(!config.ddos_protection.auto_block);
    }

    #[test]
    fn test_from_yaml_rejects_invalid_policy() {
        let yaml = r#"
rate_limiting:
  limit: 0
"#;
        assert!(matches!(
            RatewallConfig::from_yaml(yaml),
            Err(RatewallError::Config(_))
        ));
    }

    #[test]
    fn test_zero_sweep_interval_is_rejected() {
        let mut config = RatewallConfig::default();
        config.cache.sweep_interval = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_yaml_rejects_unknown_override_strategy() {
        let yaml = r#"
api_protection:
  overrides:
    /api:
      strategy: leaky_bucket
"#;
        assert!(RatewallConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_load_without_file_uses_defaults() {
        let config = RatewallConfig::load(None).unwrap();
        assert!(config.api_protection.enabled);
    }
}
