//! Transport-agnostic outcome of a protection check.
//!
//! Each transport adapter turns a [`Decision`] into its own response type.

use serde::{Deserialize, Serialize};

use crate::ratelimit::RateLimitResult;

pub const STATUS_FORBIDDEN: u16 = 403;
pub const STATUS_TOO_MANY_REQUESTS: u16 = 429;

/// JSON body sent with a rejection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

/// What the interceptor tells the framework to do with a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Run the protected handler and add `headers` to its response.
    Continue { headers: Vec<(String, String)> },
    /// Short-circuit with `status`, `headers` and a JSON `body`.
    Reject {
        status: u16,
        headers: Vec<(String, String)>,
        body: ErrorBody,
    },
}

impl Decision {
    /// Continue without adding anything to the response.
    pub fn pass() -> Self {
        Decision::Continue {
            headers: Vec::new(),
        }
    }

    /// 403 for deny-listed clients.
    pub fn forbidden(message: impl Into<String>) -> Self {
        Decision::Reject {
            status: STATUS_FORBIDDEN,
            headers: Vec::new(),
            body: ErrorBody {
                error: message.into(),
                retry_after: None,
            },
        }
    }

    /// 429 with a machine-readable retry hint.
    pub fn too_many_requests(
        message: impl Into<String>,
        retry_after_secs: u64,
        headers: Vec<(String, String)>,
    ) -> Self {
        Decision::Reject {
            status: STATUS_TOO_MANY_REQUESTS,
            headers,
            body: ErrorBody {
                error: message.into(),
                retry_after: Some(retry_after_secs),
            },
        }
    }

    pub fn is_continue(&self) -> bool {
        matches!(self, Decision::Continue { .. })
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Decision::Continue { .. } => None,
            Decision::Reject { status, .. } => Some(*status),
        }
    }

    pub fn headers(&self) -> &[(String, String)] {
        match self {
            Decision::Continue { headers } | Decision::Reject { headers, .. } => headers,
        }
    }

    /// Look up a header value by case-insensitive name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers()
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Names of the quota headers; deployments may rename them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderNames {
    #[serde(default = "default_limit_header")]
    pub limit: String,
    #[serde(default = "default_remaining_header")]
    pub remaining: String,
    #[serde(default = "default_reset_header")]
    pub reset: String,
    #[serde(default = "default_retry_after_header")]
    pub retry_after: String,
}

fn default_limit_header() -> String {
    "X-RateLimit-Limit".to_string()
}

fn default_remaining_header() -> String {
    "X-RateLimit-Remaining".to_string()
}

fn default_reset_header() -> String {
    "X-RateLimit-Reset".to_string()
}

fn default_retry_after_header() -> String {
    "X-RateLimit-Retry-After".to_string()
}

impl Default for HeaderNames {
    fn default() -> Self {
        Self {
            limit: default_limit_header(),
            remaining: default_remaining_header(),
            reset: default_reset_header(),
            retry_after: default_retry_after_header(),
        }
    }
}

impl HeaderNames {
    /// Quota headers for a result. Denials also carry the standard
    /// `Retry-After` plus the configured retry header.
    pub fn render(&self, result: &RateLimitResult) -> Vec<(String, String)> {
        let mut headers = vec![
            (self.limit.clone(), result.limit.to_string()),
            (self.remaining.clone(), result.remaining.to_string()),
            (self.reset.clone(), result.reset_time.timestamp().to_string()),
        ];
        if !result.allowed {
            let secs = result.retry_after_secs().to_string();
            headers.push(("Retry-After".to_string(), secs.clone()));
            headers.push((self.retry_after.clone(), secs));
        }
        headers
    }
}
