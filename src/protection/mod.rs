//! Request admission on top of the rate limiting strategies.
//!
//! [`DdosProtector`] runs first with a coarse per-address check, then
//! [`ApiProtector`] resolves the per-route, per-principal policy. Both
//! produce a [`Decision`] that the transport adapter applies.

mod api;
mod blocklist;
mod client;
mod ddos;
mod decision;
pub mod global;
mod headers;

pub use api::{ApiProtectionConfig, ApiProtector, LimitOverride, ResolvedPolicy};
pub use blocklist::Blocklist;
pub use client::{principal_key, ClientInfo, ANONYMOUS};
pub use ddos::{DdosProtectionConfig, DdosProtector};
pub use decision::{Decision, ErrorBody, HeaderNames, STATUS_FORBIDDEN, STATUS_TOO_MANY_REQUESTS};
pub use global::Protection;
pub use headers::{SecurityHeaders, SecurityHeadersConfig};
