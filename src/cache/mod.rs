//! Shared cache client contract and backends.
//!
//! The rate limiting strategies never talk to a concrete store; they go
//! through [`CacheClient`], which models the small set of operations a
//! networked key/value store has to provide for quota state to stay
//! consistent across process instances.

mod memory;
#[cfg(feature = "redis")]
mod redis;
mod timeout;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use memory::MemoryCache;
#[cfg(feature = "redis")]
pub use self::redis::RedisCache;
pub use timeout::TimeoutCache;

/// Errors that can occur while talking to the cache.
///
/// A missing key is not an error: [`CacheClient::get`] reports it as `Ok(None)`.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Cache connection failed: {0}")]
    Connection(String),
    #[error("Cache operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("Failed to (de)serialize cached value: {0}")]
    Serialization(String),
    #[error("Cached value for '{key}' is not valid: {reason}")]
    InvalidValue { key: String, reason: String },
    #[error("Cache backend error: {0}")]
    Backend(String),
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        CacheError::Serialization(err.to_string())
    }
}

/// Result type for cache operations.
pub type CacheResult<T> = std::result::Result<T, CacheError>;

/// Operations the engine requires from the shared store.
///
/// `increment` and `set_nx` must be atomic on the server side; everything
/// else may be a plain request/response call.
#[async_trait]
pub trait CacheClient: Send + Sync {
    /// Fetch a value. `Ok(None)` means the key does not exist.
    async fn get(&self, key: &str) -> CacheResult<Option<String>>;

    /// Store a value that expires after `ttl`.
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<()>;

    /// Store a value only if the key is absent. Returns whether it was written.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<bool>;

    /// Remove a key. Removing a missing key is not an error.
    async fn delete(&self, key: &str) -> CacheResult<()>;

    /// Atomically increment an integer value, creating it at 1 if absent.
    async fn increment(&self, key: &str) -> CacheResult<i64>;

    /// Set the time-to-live of an existing key.
    async fn expire(&self, key: &str, ttl: Duration) -> CacheResult<()>;

    /// Enumerate keys matching a glob pattern (`*`, `?` and `\` escapes).
    async fn keys(&self, pattern: &str) -> CacheResult<Vec<String>>;

    /// Drop expired entries the backend still holds. Returns how many were
    /// removed. Stores that expire keys themselves keep the default.
    fn purge_expired(&self) -> usize {
        0
    }
}

/// Escape glob metacharacters so `literal` only ever matches itself.
pub fn glob_escape(literal: &str) -> String {
    let mut escaped = String::with_capacity(literal.len());
    for c in literal.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

#[derive(Clone, Copy, PartialEq)]
enum GlobToken {
    Star,
    AnyChar,
    Literal(char),
}

fn glob_tokens(pattern: &str) -> Vec<GlobToken> {
    let mut tokens = Vec::new();
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        tokens.push(match c {
            '*' => GlobToken::Star,
            '?' => GlobToken::AnyChar,
            // A trailing backslash matches itself.
            '\\' => GlobToken::Literal(chars.next().unwrap_or('\\')),
            other => GlobToken::Literal(other),
        });
    }
    tokens
}

/// Match `value` against a glob `pattern` supporting `*`, `?` and `\`
/// escapes, with the same escaping rules as Redis `KEYS`.
pub fn glob_match(pattern: &str, value: &str) -> bool {
    let p = glob_tokens(pattern);
    let v: Vec<char> = value.chars().collect();

    let (mut pi, mut vi) = (0usize, 0usize);
    let mut star: Option<usize> = None;
    let mut star_vi = 0usize;

    while vi < v.len() {
        let step = match p.get(pi) {
            Some(GlobToken::AnyChar) => true,
            Some(GlobToken::Literal(c)) => *c == v[vi],
            _ => false,
        };
        if step {
            pi += 1;
            vi += 1;
        } else if p.get(pi) == Some(&GlobToken::Star) {
            star = Some(pi);
            star_vi = vi;
            pi += 1;
        } else if let Some(s) = star {
            // Let the last star swallow one more character and retry.
            pi = s + 1;
            star_vi += 1;
            vi = star_vi;
        } else {
            return false;
        }
    }

    while p.get(pi) == Some(&GlobToken::Star) {
        pi += 1;
    }
    pi == p.len()
}

#[cfg(test)]
pub(crate) mod testing {
    //! Test doubles for simulating a store outage.

    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    /// A cache that fails every call while `down` is set, and otherwise
    /// delegates to an in-memory store.
    pub struct FailingCache {
        inner: MemoryCache,
        down: Arc<AtomicBool>,
    }

    impl FailingCache {
        pub fn new() -> Self {
            Self {
                inner: MemoryCache::new(),
                down: Arc::new(AtomicBool::new(true)),
            }
        }

        pub fn set_down(&self, down: bool) {
            self.down.store(down, Ordering::SeqCst);
        }

        fn check(&self) -> CacheResult<()> {
            if self.down.load(Ordering::SeqCst) {
                Err(CacheError::Connection("simulated outage".to_string()))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl CacheClient for FailingCache {
        async fn get(&self, key: &str) -> CacheResult<Option<String>> {
            self.check()?;
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<()> {
            self.check()?;
            self.inner.set(key, value, ttl).await
        }

        async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<bool> {
            self.check()?;
            self.inner.set_nx(key, value, ttl).await
        }

        async fn delete(&self, key: &str) -> CacheResult<()> {
            self.check()?;
            self.inner.delete(key).await
        }

        async fn increment(&self, key: &str) -> CacheResult<i64> {
            self.check()?;
            self.inner.increment(key).await
        }

        async fn expire(&self, key: &str, ttl: Duration) -> CacheResult<()> {
            self.check()?;
            self.inner.expire(key, ttl).await
        }

        async fn keys(&self, pattern: &str) -> CacheResult<Vec<String>> {
            self.check()?;
            self.inner.keys(pattern).await
        }

        fn purge_expired(&self) -> usize {
            self.inner.purge_expired()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_literal() {
        assert!(glob_match("rate_limit:a", "rate_limit:a"));
        assert!(!glob_match("rate_limit:a", "rate_limit:b"));
    }

    #[test]
    fn test_glob_star() {
        assert!(glob_match("rl:k:entry:*", "rl:k:entry:1700000000000-abc"));
        assert!(glob_match("rl:k:*", "rl:k:"));
        assert!(!glob_match("rl:k:entry:*", "rl:other:entry:1"));
        assert!(glob_match("*:entry:*", "rl:k:entry:1"));
    }

    #[test]
    fn test_glob_question_mark() {
        assert!(glob_match("ddos:?:1.2.3.4", "ddos:m:1.2.3.4"));
        assert!(!glob_match("ddos:?:1.2.3.4", "ddos:min:1.2.3.4"));
    }

    #[test]
    fn test_glob_escapes() {
        assert!(glob_match(r"rl:/api/\*:entry:*", "rl:/api/*:entry:1-a"));
        assert!(!glob_match(r"rl:/api/\*:entry:*", "rl:/api/expensive:entry:1-a"));
        assert!(glob_match(r"a\?b", "a?b"));
        assert!(!glob_match(r"a\?b", "axb"));
        assert!(glob_match(r"a\\b", r"a\b"));
    }

    #[test]
    fn test_glob_escape_round_trip() {
        for literal in ["/api/*", "a?b", "[x]", r"back\slash", "plain"] {
            let pattern = glob_escape(literal);
            assert!(glob_match(&pattern, literal), "{} should match itself", literal);
        }
        assert_eq!(glob_escape("/api/*"), r"/api/\*");
        assert!(!glob_match(&format!("{}:*", glob_escape("/api/*")), "/api/x:1"));
    }

    #[test]
    fn test_glob_star_backtracking() {
        assert!(glob_match("a*b*c", "axxbyyc"));
        assert!(!glob_match("a*b*c", "axxbyy"));
    }
}
