//! Static response hardening headers.

use serde::{Deserialize, Serialize};

/// Values for the security headers added to every response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityHeadersConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_x_frame_options")]
    pub x_frame_options: String,
    #[serde(default = "default_x_content_type_options")]
    pub x_content_type_options: String,
    #[serde(default = "default_xss_protection")]
    pub xss_protection: String,
    #[serde(default = "default_strict_transport_security")]
    pub strict_transport_security: String,
    #[serde(default = "default_content_security_policy")]
    pub content_security_policy: String,
    #[serde(default = "default_referrer_policy")]
    pub referrer_policy: String,
    #[serde(default = "default_permissions_policy")]
    pub permissions_policy: String,
}

fn default_enabled() -> bool {
    true
}

fn default_x_frame_options() -> String {
    "DENY".to_string()
}

fn default_x_content_type_options() -> String {
    "nosniff".to_string()
}

fn default_xss_protection() -> String {
    "1; mode=block".to_string()
}

fn default_strict_transport_security() -> String {
    "max-age=31536000; includeSubDomains".to_string()
}

fn default_content_security_policy() -> String {
    "default-src 'self'".to_string()
}

fn default_referrer_policy() -> String {
    "strict-origin-when-cross-origin".to_string()
}

fn default_permissions_policy() -> String {
    "geolocation=(), microphone=(), camera=()".to_string()
}

impl Default for SecurityHeadersConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            x_frame_options: default_x_frame_options(),
            x_content_type_options: default_x_content_type_options(),
            xss_protection: default_xss_protection(),
            strict_transport_security: default_strict_transport_security(),
            content_security_policy: default_content_security_policy(),
            referrer_policy: default_referrer_policy(),
            permissions_policy: default_permissions_policy(),
        }
    }
}

/// Emits the configured security headers.
#[derive(Debug, Clone)]
pub struct SecurityHeaders {
    headers: Vec<(&'static str, String)>,
}

impl SecurityHeaders {
    pub fn new(config: &SecurityHeadersConfig) -> Self {
        let headers = if config.enabled {
            vec![
                ("X-Frame-Options", config.x_frame_options.clone()),
                ("X-Content-Type-Options", config.x_content_type_options.clone()),
                ("X-XSS-Protection", config.xss_protection.clone()),
                ("Strict-Transport-Security", config.strict_transport_security.clone()),
                ("Content-Security-Policy", config.content_security_policy.clone()),
                ("Referrer-Policy", config.referrer_policy.clone()),
                ("Permissions-Policy", config.permissions_policy.clone()),
            ]
        } else {
            Vec::new()
        };
        Self { headers }
    }

    /// Headers to set, empty when disabled. Blank values are skipped.
    pub fn headers(&self) -> impl Iterator<Item = (&'static str, &str)> {
        self.headers
            .iter()
            .filter(|(_, v)| !v.is_empty())
            .map(|(n, v)| (*n, v.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let headers = SecurityHeaders::new(&SecurityHeadersConfig::default());
        let all: Vec<_> = headers.headers().collect();
        assert_eq!(all.len(), 7);
        assert!(all.contains(&("X-Frame-Options", "DENY")));
        assert!(all.contains(&("Referrer-Policy", "strict-origin-when-cross-origin")));
    }

    #[test]
    fn test_custom_and_blank_values() {
        let config = SecurityHeadersConfig {
            referrer_policy: "no-referrer".to_string(),
            content_security_policy: String::new(),
            ..SecurityHeadersConfig::default()
        };
        let headers = SecurityHeaders::new(&config);
        let all: Vec<_> = headers.headers().collect();
        assert_eq!(all.len(), 6);
        assert!(all.contains(&("Referrer-Policy", "no-referrer")));
    }

    #[test]
    fn test_disabled_emits_nothing() {
        let config = SecurityHeadersConfig {
            enabled: false,
            ..SecurityHeadersConfig::default()
        };
        assert_eq!(SecurityHeaders::new(&config).headers().count(), 0);
    }
}
