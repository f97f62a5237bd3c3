//! In-process store.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::debug;

use super::{CounterEntry, CounterStore, StoreFuture, expiry_after};

#[derive(Debug, Clone)]
struct Record {
    value: String,
    expires_at: Option<DateTime<Utc>>,
}

impl Record {
    fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_none_or(|at| now < at)
    }
}

/// Counter and record store backed by process memory.
///
/// Expired entries are treated as absent on read and physically removed by
/// [`MemoryStore::sweep`]. State is per-process only.
#[derive(Debug, Default)]
pub struct MemoryStore {
    counters: RwLock<HashMap<String, CounterEntry>>,
    records: RwLock<HashMap<String, Record>>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment synchronously.
    pub fn increment_now(&self, key: &str, window: Duration) -> CounterEntry {
        let now = Utc::now();
        let mut counters = self.counters.write();
        let entry = counters
            .entry(key.to_string())
            .and_modify(|entry| {
                if entry.is_expired_at(now) {
                    entry.count = 1;
                    entry.reset_at = expiry_after(now, window);
                } else {
                    entry.count = entry.count.saturating_add(1);
                }
            })
            .or_insert_with(|| CounterEntry {
                key: key.to_string(),
                count: 1,
                reset_at: expiry_after(now, window),
            });
        entry.clone()
    }

    /// Read a live counter synchronously.
    #[must_use]
    pub fn get_now(&self, key: &str) -> Option<CounterEntry> {
        let now = Utc::now();
        self.counters
            .read()
            .get(key)
            .filter(|entry| !entry.is_expired_at(now))
            .cloned()
    }

    /// Number of stored counters and records, including expired ones.
    #[must_use]
    pub fn len(&self) -> usize {
        self.counters.read().len() + self.records.read().len()
    }

    /// Check if the store holds nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove expired counters and records, returning how many were dropped.
    pub fn sweep(&self) -> usize {
        let now = Utc::now();

        let mut counters = self.counters.write();
        let before = counters.len();
        counters.retain(|_, entry| !entry.is_expired_at(now));
        let mut removed = before - counters.len();
        drop(counters);

        let mut records = self.records.write();
        let before = records.len();
        records.retain(|_, record| record.is_live_at(now));
        removed += before - records.len();

        if removed > 0 {
            debug!(removed, "swept expired memory store entries");
        }
        removed
    }
}

impl CounterStore for MemoryStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    fn increment<'a>(&'a self, key: &'a str, window: Duration) -> StoreFuture<'a, CounterEntry> {
        Box::pin(async move { Ok(self.increment_now(key, window)) })
    }

    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<CounterEntry>> {
        Box::pin(async move { Ok(self.get_now(key)) })
    }

    fn remove<'a>(&'a self, key: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.counters.write().remove(key);
            Ok(())
        })
    }

    fn list_active(&self) -> StoreFuture<'_, Vec<CounterEntry>> {
        Box::pin(async move {
            let now = Utc::now();
            Ok(self
                .counters
                .read()
                .values()
                .filter(|entry| !entry.is_expired_at(now))
                .cloned()
                .collect())
        })
    }

    fn put_record<'a>(
        &'a self,
        key: &'a str,
        value: String,
        ttl: Option<Duration>,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let expires_at = ttl.map(|ttl| expiry_after(Utc::now(), ttl));
            self.records
                .write()
                .insert(key.to_string(), Record { value, expires_at });
            Ok(())
        })
    }

    fn get_record<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<String>> {
        Box::pin(async move {
            let now = Utc::now();
            Ok(self
                .records
                .read()
                .get(key)
                .filter(|record| record.is_live_at(now))
                .map(|record| record.value.clone()))
        })
    }

    fn remove_record<'a>(&'a self, key: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let now = Utc::now();
            Ok(self
                .records
                .write()
                .remove(key)
                .is_some_and(|record| record.is_live_at(now)))
        })
    }

    fn list_records<'a>(&'a self, prefix: &'a str) -> StoreFuture<'a, Vec<(String, String)>> {
        Box::pin(async move {
            let now = Utc::now();
            Ok(self
                .records
                .read()
                .iter()
                .filter(|(key, record)| key.starts_with(prefix) && record.is_live_at(now))
                .map(|(key, record)| (key.clone(), record.value.clone()))
                .collect())
        })
    }
}
