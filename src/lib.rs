//! Ratewall - Rate Limiting and API Protection
//!
//! This crate decides, per incoming request, whether to admit or reject it.
//! Quotas are enforced by pluggable strategies (fixed window, sliding window,
//! token bucket) whose state lives in a shared cache, so several instances
//! of a service enforce one quota together. On top sit an API protector
//! that resolves per-path and per-principal policy, and a DDoS protector
//! with per-address ceilings and automatic blocking.

pub mod cache;
pub mod config;
pub mod error;
pub mod http;
pub mod protection;
pub mod ratelimit;
