//! Request-level rate limiting.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::RateLimitConfig;
use crate::identity::ClientIdentity;
use crate::store::{CounterStore, expiry_after};

/// Key prefix for rate-limit windows in the counter store.
const KEY_PREFIX: &str = "rl:";

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitDecision {
    /// Whether the request is within the limit.
    pub allowed: bool,
    /// Configured requests per window.
    pub limit: u32,
    /// Requests counted in the current window, including this one.
    pub count: u64,
    /// Requests left in the current window.
    pub remaining: u32,
    /// End of the current window.
    pub reset_at: DateTime<Utc>,
    /// Window length in seconds.
    pub window_secs: u64,
}

impl RateLimitDecision {
    fn from_count(limit: u32, count: u64, reset_at: DateTime<Utc>, window_secs: u64) -> Self {
        Self {
            allowed: count <= u64::from(limit),
            limit,
            count,
            remaining: u64::from(limit).saturating_sub(count) as u32,
            reset_at,
            window_secs,
        }
    }

    /// Whole seconds until the window resets, clamped to `0..=window`.
    #[must_use]
    pub fn retry_after_secs(&self) -> u64 {
        let millis = (self.reset_at - Utc::now()).num_milliseconds().max(0) as u64;
        millis.div_ceil(1000).min(self.window_secs)
    }

    /// Window reset as Unix seconds, for `X-RateLimit-Reset`.
    #[must_use]
    pub fn reset_epoch_secs(&self) -> i64 {
        self.reset_at.timestamp()
    }
}

/// Fixed-window request limiter keyed by client identity.
///
/// Counting goes through the shared [`CounterStore`] so that several server
/// instances backed by the same external store enforce one limit.
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    config: RateLimitConfig,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("backend", &self.store.backend_name())
            .field("config", &self.config)
            .finish()
    }
}

impl RateLimiter {
    /// Create a limiter over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn CounterStore>, config: RateLimitConfig) -> Self {
        Self { store, config }
    }

    /// Active configuration.
    #[must_use]
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    fn key(identity: &ClientIdentity) -> String {
        format!("{KEY_PREFIX}{identity}")
    }

    fn window_secs(&self) -> u64 {
        self.config.window.as_secs()
    }

    fn untracked(&self) -> RateLimitDecision {
        RateLimitDecision::from_count(
            self.config.max_requests,
            0,
            expiry_after(Utc::now(), self.config.window),
            self.window_secs(),
        )
    }

    /// Count a request and decide whether it is within the limit.
    ///
    /// A store failure allows the request.
    pub async fn check_limit(&self, identity: &ClientIdentity) -> RateLimitDecision {
        if !self.config.enabled {
            return self.untracked();
        }

        let key = Self::key(identity);
        match self.store.increment(&key, self.config.window).await {
            Ok(entry) => {
                let decision = RateLimitDecision::from_count(
                    self.config.max_requests,
                    entry.count,
                    entry.reset_at,
                    self.window_secs(),
                );
                if !decision.allowed {
                    debug!(ip = %identity, count = entry.count, limit = self.config.max_requests, "rate limit exceeded");
                }
                decision
            }
            Err(err) => {
                warn!(ip = %identity, error = %err, "rate limit store failed, allowing request");
                self.untracked()
            }
        }
    }

    /// Read the current window without counting a request.
    pub async fn status(&self, identity: &ClientIdentity) -> RateLimitDecision {
        match self.store.get(&Self::key(identity)).await {
            Ok(Some(entry)) => RateLimitDecision::from_count(
                self.config.max_requests,
                entry.count,
                entry.reset_at,
                self.window_secs(),
            ),
            Ok(None) => self.untracked(),
            Err(err) => {
                warn!(ip = %identity, error = %err, "rate limit status lookup failed");
                self.untracked()
            }
        }
    }

    /// Clear the window for an identity.
    pub async fn reset(&self, identity: &ClientIdentity) {
        if let Err(err) = self.store.remove(&Self::key(identity)).await {
            warn!(ip = %identity, error = %err, "failed to reset rate limit");
        } else {
            debug!(ip = %identity, "rate limit reset");
        }
    }
}
