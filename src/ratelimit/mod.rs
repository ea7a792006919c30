//! Rate limiting strategies and their registry.

mod fixed_window;
mod lock;
mod manager;
mod sliding_window;
mod token_bucket;
mod types;

pub use fixed_window::FixedWindowLimiter;
pub use lock::{KeyLock, LockGuard};
pub use manager::{PolicyOverride, RateLimitManager};
pub use sliding_window::SlidingWindowLimiter;
pub use token_bucket::{TokenBucket, TokenBucketLimiter};
pub use types::{RateLimitConfig, RateLimitResult, RateLimiter, StrategyKind};

#[cfg(test)]
pub(crate) mod test_support {
    use std::time::Duration;

    use chrono::Utc;

    /// Sleep into a fresh epoch-aligned window if fewer than `margin` remain
    /// in the current one, so a test's burst cannot straddle a boundary.
    pub async fn align_to_window(window: Duration, margin: Duration) {
        let window_ms = window.as_millis() as i64;
        let now_ms = Utc::now().timestamp_millis();
        let left_ms = window_ms - now_ms.rem_euclid(window_ms);
        if left_ms < margin.as_millis() as i64 {
            tokio::time::sleep(Duration::from_millis(left_ms as u64 + 10)).await;
        }
    }
}
