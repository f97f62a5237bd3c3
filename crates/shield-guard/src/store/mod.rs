//! Time-windowed counter and record storage.
//!
//! [`CounterStore`] abstracts the backend shared by the rate limiter and the
//! blacklist. Two implementations exist:
//!
//! - [`MemoryStore`]: per-process maps with lazy expiry.
//! - [`RedisStore`]: an external Redis instance shared across processes.
//!
//! Callers always hold a [`FallbackStore`], which routes to Redis when one is
//! configured and reachable and transparently answers from memory otherwise.
//! Use [`connect_store`] to build it from configuration.

mod fallback;
mod memory;
mod redis_store;
#[cfg(test)]
pub(crate) mod testing;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::StoreConfig;
use crate::error::StoreResult;

pub use fallback::FallbackStore;
pub use memory::MemoryStore;
pub use redis_store::RedisStore;

/// Boxed future returned by [`CounterStore`] methods.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = StoreResult<T>> + Send + 'a>>;

/// A live counter window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterEntry {
    /// Counter key.
    pub key: String,
    /// Requests observed in the current window.
    pub count: u64,
    /// End of the current window.
    pub reset_at: DateTime<Utc>,
}

impl CounterEntry {
    /// Check if the window has elapsed at `now`.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.reset_at
    }
}

/// Storage backend for windowed counters and TTL records.
///
/// Every mutation is atomic for a single key. Expired counters and records
/// read as absent.
pub trait CounterStore: Send + Sync {
    /// Short backend name for logs and health output.
    fn backend_name(&self) -> &'static str;

    /// Increment the counter for `key` and return the updated window.
    ///
    /// When no live window exists a fresh one of length `window` is opened
    /// with a count of 1.
    fn increment<'a>(&'a self, key: &'a str, window: Duration) -> StoreFuture<'a, CounterEntry>;

    /// Read the live window for `key`.
    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<CounterEntry>>;

    /// Drop the counter for `key`.
    fn remove<'a>(&'a self, key: &'a str) -> StoreFuture<'a, ()>;

    /// List every live counter window.
    fn list_active(&self) -> StoreFuture<'_, Vec<CounterEntry>>;

    /// Upsert a record, optionally expiring after `ttl`.
    fn put_record<'a>(
        &'a self,
        key: &'a str,
        value: String,
        ttl: Option<Duration>,
    ) -> StoreFuture<'a, ()>;

    /// Read a live record.
    fn get_record<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<String>>;

    /// Delete a record. Returns whether one existed.
    fn remove_record<'a>(&'a self, key: &'a str) -> StoreFuture<'a, bool>;

    /// List live records whose key starts with `prefix`.
    fn list_records<'a>(&'a self, prefix: &'a str) -> StoreFuture<'a, Vec<(String, String)>>;
}

/// Build the process-wide store from configuration.
///
/// Without a Redis URL, or when the initial connection fails, the returned
/// store runs on memory alone. Callers never branch on the outcome.
pub async fn connect_store(config: &StoreConfig) -> Arc<FallbackStore> {
    let Some(url) = config.redis_url.as_deref() else {
        info!(backend = "memory", "no external store configured");
        return Arc::new(FallbackStore::new(None));
    };

    match RedisStore::connect(url, config).await {
        Ok(store) => {
            info!(backend = "redis", namespace = %config.namespace, "connected to external store");
            Arc::new(FallbackStore::new(Some(Arc::new(store))))
        }
        Err(err) => {
            warn!(backend = "redis", error = %err, "external store unreachable, using memory");
            Arc::new(FallbackStore::new(None))
        }
    }
}

/// Instant at which something that starts at `now` and lasts `window` ends.
pub(crate) fn expiry_after(now: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(window)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
