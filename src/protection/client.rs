//! Per-request client identity.

use std::fmt;

/// Principal id used when the request carries no authenticated identity.
pub const ANONYMOUS: &str = "anonymous";

/// Who is making a request, captured fresh for each request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    pub ip: String,
    pub principal: String,
    pub user_agent: String,
    pub path: String,
}

impl ClientInfo {
    /// Build a snapshot; a missing or empty principal becomes [`ANONYMOUS`].
    pub fn new(
        ip: impl Into<String>,
        principal: Option<&str>,
        user_agent: impl Into<String>,
        path: impl Into<String>,
    ) -> Self {
        let principal = match principal {
            Some(p) if !p.is_empty() => p.to_string(),
            _ => ANONYMOUS.to_string(),
        };
        Self {
            ip: ip.into(),
            principal,
            user_agent: user_agent.into(),
            path: path.into(),
        }
    }

    pub fn is_anonymous(&self) -> bool {
        self.principal == ANONYMOUS
    }

    /// The override-map key for this client's principal.
    pub fn principal_key(&self) -> String {
        principal_key(&self.principal)
    }

    /// The cache key scoping this client's quota to the requested path.
    ///
    /// Authenticated clients are tracked by principal, anonymous ones by address.
    pub fn admission_key(&self) -> String {
        if self.is_anonymous() {
            format!("ip:{}:{}", self.ip, self.path)
        } else {
            format!("principal:{}:{}", self.principal, self.path)
        }
    }
}

/// Composite key under which per-principal overrides are configured.
pub fn principal_key(principal: &str) -> String {
    format!("principal:{}", principal)
}

impl fmt::Display for ClientInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{} {}", self.principal, self.ip, self.path)
    }
}
