//! Error types for the Ratewall engine.

use thiserror::Error;

use crate::cache::CacheError;

/// Main error type for Ratewall operations.
#[derive(Error, Debug)]
pub enum RatewallError {
    /// Configuration-related errors (invalid policy, unknown strategy names)
    #[error("Configuration error: {0}")]
    Config(String),

    /// A dispatch targeted a strategy id nobody registered
    #[error("Rate limit strategy '{0}' is not registered")]
    UnregisteredStrategy(String),

    /// Backing store failures that were not absorbed by a fail-open policy
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    /// HTTP server errors
    #[error("HTTP error: {0}")]
    Http(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RatewallError {
    /// Whether this error came from the backing store rather than from setup.
    pub fn is_cache(&self) -> bool {
        matches!(self, RatewallError::Cache(_))
    }
}

/// Result type alias for Ratewall operations.
pub type Result<T> = std::result::Result<T, RatewallError>;
