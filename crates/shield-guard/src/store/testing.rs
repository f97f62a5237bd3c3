//! Store doubles shared by unit tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use super::{CounterEntry, CounterStore, MemoryStore, StoreFuture};
use crate::error::{StoreError, StoreResult};

/// Primary that fails every call while `down` is set.
pub(crate) struct FlakyStore {
    pub(crate) down: AtomicBool,
    pub(crate) calls: AtomicUsize,
    pub(crate) inner: MemoryStore,
}

impl FlakyStore {
    pub(crate) fn new(down: bool) -> Self {
        Self {
            down: AtomicBool::new(down),
            calls: AtomicUsize::new(0),
            inner: MemoryStore::new(),
        }
    }

    fn check(&self) -> StoreResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.down.load(Ordering::SeqCst) {
            Err(StoreError::Connection("connection refused".into()))
        } else {
            Ok(())
        }
    }
}

impl CounterStore for FlakyStore {
    fn backend_name(&self) -> &'static str {
        "flaky"
    }

    fn increment<'a>(&'a self, key: &'a str, window: Duration) -> StoreFuture<'a, CounterEntry> {
        Box::pin(async move {
            self.check()?;
            self.inner.increment(key, window).await
        })
    }

    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<CounterEntry>> {
        Box::pin(async move {
            self.check()?;
            self.inner.get(key).await
        })
    }

    fn remove<'a>(&'a self, key: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.check()?;
            self.inner.remove(key).await
        })
    }

    fn list_active(&self) -> StoreFuture<'_, Vec<CounterEntry>> {
        Box::pin(async move {
            self.check()?;
            self.inner.list_active().await
        })
    }

    fn put_record<'a>(
        &'a self,
        key: &'a str,
        value: String,
        ttl: Option<Duration>,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.check()?;
            self.inner.put_record(key, value, ttl).await
        })
    }

    fn get_record<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<String>> {
        Box::pin(async move {
            self.check()?;
            self.inner.get_record(key).await
        })
    }

    fn remove_record<'a>(&'a self, key: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            self.check()?;
            self.inner.remove_record(key).await
        })
    }

    fn list_records<'a>(&'a self, prefix: &'a str) -> StoreFuture<'a, Vec<(String, String)>> {
        Box::pin(async move {
            self.check()?;
            self.inner.list_records(prefix).await
        })
    }
}
