//! # shield-guard
//!
//! Edge admission pipeline deciding, per inbound request, whether traffic
//! reaches the application.
//!
//! ## Stages
//!
//! - admin whitelist ([`GuardConfig::admin_ips`])
//! - [`Blacklist`] - TTL-bound blocks with graduated violation escalation
//! - [`GeoResolver`] - platform hint, then two geo-IP providers, then fallback
//! - [`VpnResolver`] - concurrent VPN/proxy providers fused into one verdict
//! - [`RateLimiter`] - fixed-window request counting
//! - [`RiskScorer`] - heuristic user-agent, signature and cookie scoring
//!
//! [`AdmissionPipeline`] runs them in that order and produces an
//! [`AdmissionDecision`]. Every conclusive decision lands in the
//! [`SecurityAuditLog`].
//!
//! ## Storage
//!
//! Counters and blacklist records live behind [`CounterStore`]. A
//! [`FallbackStore`] prefers Redis when configured and falls back to memory
//! whenever it is unreachable.
//!
//! # Example
//!
//! ```rust,no_run
//! use shield_guard::{AdmissionPipeline, GuardComponents, GuardConfig, RequestInfo};
//!
//! # async fn run() -> shield_guard::GuardResult<()> {
//! let config = GuardConfig::from_env()?;
//! let components = GuardComponents::build(&config).await?;
//! let pipeline = AdmissionPipeline::new(config, components);
//!
//! let request = RequestInfo::new("GET", "/")
//!     .with_header("X-Forwarded-For", "81.2.69.142")
//!     .with_header("User-Agent", "Mozilla/5.0");
//! let decision = pipeline.evaluate(&request).await;
//! if !decision.allowed {
//!     println!("denied with {}", decision.status);
//! }
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod audit;
pub mod blacklist;
pub mod config;
pub mod error;
pub mod geo;
pub mod identity;
pub mod pipeline;
pub mod rate_limit;
pub mod request;
pub mod response;
pub mod risk;
pub mod store;
pub mod vpn;

// Re-export main types
pub use audit::{
    AuditStats, HttpLogSink, LogSink, SecurityAuditLog, SecurityEventType, SecurityLogEntry,
};
pub use blacklist::{Blacklist, BlacklistEntry, EntryStatus};
pub use config::{
    AuditConfig, BlacklistConfig, GeoConfig, GuardConfig, GuardConfigBuilder, RateLimitConfig,
    RiskConfig, StoreConfig, VpnConfig,
};
pub use error::{GuardError, GuardFuture, GuardResult, StoreError, StoreResult};
pub use geo::{GeoLookup, GeoProvider, GeoResolver, GeoResult, GeoSource};
pub use identity::ClientIdentity;
pub use pipeline::{AdmissionDecision, AdmissionPipeline, GuardComponents, Stage};
pub use rate_limit::{RateLimitDecision, RateLimiter};
pub use request::RequestInfo;
pub use response::ErrorBody;
pub use risk::{RiskAssessment, RiskScorer};
pub use store::{CounterEntry, CounterStore, FallbackStore, MemoryStore, RedisStore};
pub use vpn::{ProviderVerdict, VpnDecision, VpnProvider, VpnResolver, VpnResult};

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::audit::{SecurityAuditLog, SecurityEventType, SecurityLogEntry};
    pub use crate::blacklist::Blacklist;
    pub use crate::config::GuardConfig;
    pub use crate::error::{GuardError, GuardResult};
    pub use crate::identity::ClientIdentity;
    pub use crate::pipeline::{AdmissionDecision, AdmissionPipeline, GuardComponents};
    pub use crate::rate_limit::RateLimiter;
    pub use crate::request::RequestInfo;
}
