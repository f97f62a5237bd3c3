//! Primary-with-memory-fallback routing.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::{CounterEntry, CounterStore, MemoryStore, StoreFuture};
use crate::error::{StoreError, StoreResult};

/// How long a degraded store answers from memory before probing the primary.
const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(5);

/// Store that prefers an external primary and falls back to memory.
///
/// Operations never fail: a primary error is logged and the same call is
/// served from the in-process [`MemoryStore`]. A warning is emitted once when
/// a failure episode starts, and an info event when the primary answers
/// again. While degraded the primary is only probed every few seconds so a
/// dead backend does not add its timeout to every request.
pub struct FallbackStore {
    primary: Option<Arc<dyn CounterStore>>,
    memory: MemoryStore,
    degraded: AtomicBool,
    episodes: AtomicU64,
    next_probe: Mutex<Option<Instant>>,
    probe_interval: Duration,
}

impl std::fmt::Debug for FallbackStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FallbackStore")
            .field("primary", &self.primary.as_ref().map(|p| p.backend_name()))
            .field("degraded", &self.is_degraded())
            .field("episodes", &self.fallback_episodes())
            .finish_non_exhaustive()
    }
}

impl FallbackStore {
    /// Wrap an optional primary backend.
    #[must_use]
    pub fn new(primary: Option<Arc<dyn CounterStore>>) -> Self {
        Self {
            primary,
            memory: MemoryStore::new(),
            degraded: AtomicBool::new(false),
            episodes: AtomicU64::new(0),
            next_probe: Mutex::new(None),
            probe_interval: DEFAULT_PROBE_INTERVAL,
        }
    }

    /// Store without a primary.
    #[must_use]
    pub fn memory_only() -> Self {
        Self::new(None)
    }

    /// Override how long a degraded store waits before probing the primary.
    #[must_use]
    pub const fn with_probe_interval(mut self, interval: Duration) -> Self {
        self.probe_interval = interval;
        self
    }

    /// Whether a primary backend is configured.
    #[must_use]
    pub fn has_primary(&self) -> bool {
        self.primary.is_some()
    }

    /// Whether calls are currently being served from memory due to a failure.
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    /// Number of failure episodes since startup.
    #[must_use]
    pub fn fallback_episodes(&self) -> u64 {
        self.episodes.load(Ordering::Relaxed)
    }

    /// The in-process store used for fallback and memory-only mode.
    #[must_use]
    pub fn memory(&self) -> &MemoryStore {
        &self.memory
    }

    /// Evict expired entries from the memory side.
    pub fn sweep(&self) -> usize {
        self.memory.sweep()
    }

    fn primary_for_call(&self) -> Option<&dyn CounterStore> {
        let primary = self.primary.as_deref()?;
        if self.is_degraded() {
            let mut next_probe = self.next_probe.lock();
            let now = Instant::now();
            if next_probe.is_some_and(|at| now < at) {
                return None;
            }
            *next_probe = Some(now + self.probe_interval);
        }
        Some(primary)
    }

    fn on_success(&self, backend: &'static str) {
        if self.degraded.swap(false, Ordering::AcqRel) {
            *self.next_probe.lock() = None;
            info!(backend, "external store recovered");
        }
    }

    fn on_failure(&self, backend: &'static str, op: &'static str, err: &StoreError) {
        if self.degraded.swap(true, Ordering::AcqRel) {
            debug!(backend, op, error = %err, "external store still unavailable");
        } else {
            self.episodes.fetch_add(1, Ordering::Relaxed);
            *self.next_probe.lock() = Some(Instant::now() + self.probe_interval);
            warn!(backend, op, error = %err, "external store unavailable, serving from memory");
        }
    }

    async fn route<'a, T>(
        &'a self,
        op: &'static str,
        primary_call: impl FnOnce(&'a dyn CounterStore) -> StoreFuture<'a, T>,
        memory_call: impl FnOnce(&'a MemoryStore) -> StoreFuture<'a, T>,
    ) -> StoreResult<T> {
        if let Some(primary) = self.primary_for_call() {
            match primary_call(primary).await {
                Ok(value) => {
                    self.on_success(primary.backend_name());
                    return Ok(value);
                }
                Err(err) => self.on_failure(primary.backend_name(), op, &err),
            }
        }
        memory_call(&self.memory).await
    }
}

impl CounterStore for FallbackStore {
    fn backend_name(&self) -> &'static str {
        self.primary
            .as_ref()
            .map_or_else(|| self.memory.backend_name(), |p| p.backend_name())
    }

    fn increment<'a>(&'a self, key: &'a str, window: Duration) -> StoreFuture<'a, CounterEntry> {
        Box::pin(self.route(
            "increment",
            move |p| p.increment(key, window),
            move |m| m.increment(key, window),
        ))
    }

    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<CounterEntry>> {
        Box::pin(self.route("get", move |p| p.get(key), move |m| m.get(key)))
    }

    fn remove<'a>(&'a self, key: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            // Clear both sides so a recovered primary and the fallback agree.
            self.memory.remove(key).await?;
            let already_cleared =
                |_: &'a MemoryStore| -> StoreFuture<'a, ()> { Box::pin(async { Ok(()) }) };
            self.route("remove", move |p| p.remove(key), already_cleared).await
        })
    }

    fn list_active(&self) -> StoreFuture<'_, Vec<CounterEntry>> {
        Box::pin(self.route("list_active", |p| p.list_active(), |m| m.list_active()))
    }

    fn put_record<'a>(
        &'a self,
        key: &'a str,
        value: String,
        ttl: Option<Duration>,
    ) -> StoreFuture<'a, ()> {
        let fallback_value = value.clone();
        Box::pin(self.route(
            "put_record",
            move |p| p.put_record(key, value, ttl),
            move |m| m.put_record(key, fallback_value, ttl),
        ))
    }

    fn get_record<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<String>> {
        Box::pin(self.route("get_record", move |p| p.get_record(key), move |m| m.get_record(key)))
    }

    fn remove_record<'a>(&'a self, key: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let removed_locally = self.memory.remove_record(key).await?;
            let removed = self
                .route(
                    "remove_record",
                    move |p| p.remove_record(key),
                    |_: &'a MemoryStore| -> StoreFuture<'a, bool> {
                        Box::pin(async { Ok(false) })
                    },
                )
                .await?;
            Ok(removed || removed_locally)
        })
    }

    fn list_records<'a>(&'a self, prefix: &'a str) -> StoreFuture<'a, Vec<(String, String)>> {
        Box::pin(self.route(
            "list_records",
            move |p| p.list_records(prefix),
            move |m| m.list_records(prefix),
        ))
    }
}
