//! Redis-backed store shared across server instances.

use std::future::Future;
use std::time::Duration;

use chrono::Utc;
use redis::aio::ConnectionManager;
use tracing::debug;

use super::{CounterEntry, CounterStore, StoreFuture, expiry_after};
use crate::config::StoreConfig;
use crate::error::{StoreError, StoreResult};

const SCAN_BATCH: usize = 200;

/// Counter and record store backed by Redis.
///
/// Counters live under `{namespace}:c:{key}` and records under
/// `{namespace}:r:{key}`. Expiry is delegated to Redis key TTLs.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    namespace: String,
    command_timeout: Duration,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("namespace", &self.namespace)
            .field("command_timeout", &self.command_timeout)
            .finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connect within the configured connect timeout.
    pub async fn connect(url: &str, config: &StoreConfig) -> StoreResult<Self> {
        let client = redis::Client::open(url)?;
        let conn = tokio::time::timeout(config.connect_timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| {
                StoreError::Connection(format!(
                    "connect timed out after {}ms",
                    config.connect_timeout.as_millis()
                ))
            })??;

        Ok(Self {
            conn,
            namespace: config.namespace.clone(),
            command_timeout: config.command_timeout,
        })
    }

    fn counter_key(&self, key: &str) -> String {
        format!("{}:c:{key}", self.namespace)
    }

    fn record_key(&self, key: &str) -> String {
        format!("{}:r:{key}", self.namespace)
    }

    /// Run one Redis round trip under the command timeout.
    async fn run<T, F>(&self, command: &'static str, fut: F) -> StoreResult<T>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.command_timeout, fut).await {
            Ok(result) => result.map_err(StoreError::from),
            Err(_) => Err(StoreError::Command {
                command,
                reason: format!("timed out after {}ms", self.command_timeout.as_millis()),
            }),
        }
    }

    async fn scan(&self, pattern: String) -> StoreResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = self
                .run(
                    "SCAN",
                    redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(&pattern)
                        .arg("COUNT")
                        .arg(SCAN_BATCH)
                        .query_async(&mut conn),
                )
                .await?;
            keys.extend(batch);
            if next == 0 {
                return Ok(keys);
            }
            cursor = next;
        }
    }

    async fn read_counter(&self, full_key: &str, key: &str) -> StoreResult<Option<CounterEntry>> {
        let mut conn = self.conn.clone();
        let (count, pttl): (Option<u64>, i64) = self
            .run(
                "GET",
                redis::pipe()
                    .cmd("GET")
                    .arg(full_key)
                    .cmd("PTTL")
                    .arg(full_key)
                    .query_async(&mut conn),
            )
            .await?;

        // PTTL is -2 for a missing key and -1 for a key without expiry.
        Ok(count.filter(|_| pttl > 0).map(|count| CounterEntry {
            key: key.to_string(),
            count,
            reset_at: expiry_after(Utc::now(), Duration::from_millis(pttl.unsigned_abs())),
        }))
    }
}

impl CounterStore for RedisStore {
    fn backend_name(&self) -> &'static str {
        "redis"
    }

    fn increment<'a>(&'a self, key: &'a str, window: Duration) -> StoreFuture<'a, CounterEntry> {
        Box::pin(async move {
            let full_key = self.counter_key(key);
            let window_ms = u64::try_from(window.as_millis()).unwrap_or(u64::MAX).max(1);
            let mut conn = self.conn.clone();

            // SET NX opens the window only when no live key exists; INCR and
            // PTTL then read the state in the same transaction.
            let (count, pttl): (u64, i64) = self
                .run(
                    "INCR",
                    redis::pipe()
                        .atomic()
                        .cmd("SET")
                        .arg(&full_key)
                        .arg(0)
                        .arg("PX")
                        .arg(window_ms)
                        .arg("NX")
                        .ignore()
                        .cmd("INCR")
                        .arg(&full_key)
                        .cmd("PTTL")
                        .arg(&full_key)
                        .query_async(&mut conn),
                )
                .await?;

            let remaining = if pttl > 0 { pttl.unsigned_abs() } else { window_ms };
            Ok(CounterEntry {
                key: key.to_string(),
                count,
                reset_at: expiry_after(Utc::now(), Duration::from_millis(remaining)),
            })
        })
    }

    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<CounterEntry>> {
        Box::pin(async move { self.read_counter(&self.counter_key(key), key).await })
    }

    fn remove<'a>(&'a self, key: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let _: i64 = self
                .run(
                    "DEL",
                    redis::cmd("DEL").arg(self.counter_key(key)).query_async(&mut conn),
                )
                .await?;
            Ok(())
        })
    }

    fn list_active(&self) -> StoreFuture<'_, Vec<CounterEntry>> {
        Box::pin(async move {
            let prefix = self.counter_key("");
            let keys = self.scan(format!("{prefix}*")).await?;
            let mut entries = Vec::with_capacity(keys.len());
            for full_key in keys {
                let key = full_key.strip_prefix(&prefix).unwrap_or(&full_key);
                if let Some(entry) = self.read_counter(&full_key, key).await? {
                    entries.push(entry);
                }
            }
            debug!(count = entries.len(), "listed redis counters");
            Ok(entries)
        })
    }

    fn put_record<'a>(
        &'a self,
        key: &'a str,
        value: String,
        ttl: Option<Duration>,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let mut cmd = redis::cmd("SET");
            cmd.arg(self.record_key(key)).arg(value);
            if let Some(ttl) = ttl {
                let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
                cmd.arg("PX").arg(ttl_ms);
            }
            let _: () = self.run("SET", cmd.query_async(&mut conn)).await?;
            Ok(())
        })
    }

    fn get_record<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<String>> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            self.run(
                "GET",
                redis::cmd("GET").arg(self.record_key(key)).query_async(&mut conn),
            )
            .await
        })
    }

    fn remove_record<'a>(&'a self, key: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let removed: i64 = self
                .run(
                    "DEL",
                    redis::cmd("DEL").arg(self.record_key(key)).query_async(&mut conn),
                )
                .await?;
            Ok(removed > 0)
        })
    }

    fn list_records<'a>(&'a self, prefix: &'a str) -> StoreFuture<'a, Vec<(String, String)>> {
        Box::pin(async move {
            let namespace_prefix = self.record_key("");
            let keys = self.scan(format!("{namespace_prefix}{prefix}*")).await?;
            if keys.is_empty() {
                return Ok(Vec::new());
            }

            let mut conn = self.conn.clone();
            let mut pipe = redis::pipe();
            for key in &keys {
                pipe.cmd("GET").arg(key);
            }
            let values: Vec<Option<String>> =
                self.run("GET", pipe.query_async(&mut conn)).await?;

            // Keys can expire between SCAN and GET.
            Ok(keys
                .iter()
                .zip(values)
                .filter_map(|(full_key, value)| {
                    let key = full_key.strip_prefix(&namespace_prefix)?;
                    Some((key.to_string(), value?))
                })
                .collect())
        })
    }
}
