//! Client blacklist with graduated violation escalation.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::BlacklistConfig;
use crate::error::GuardResult;
use crate::identity::ClientIdentity;
use crate::store::{CounterStore, expiry_after};

/// Record key prefix for entries.
const ENTRY_PREFIX: &str = "bl:";
/// Records outlive their logical expiry by this much so `cleanup` can count
/// them before the backend drops them.
const RETENTION_GRACE: Duration = Duration::from_secs(3_600);

/// Whether an entry denies traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    /// Provisional entry below the promotion threshold; does not deny.
    Watch,
    /// Full block.
    Blocked,
}

/// A blacklisted (or watched) client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlacklistEntry {
    /// Client identity.
    pub ip: String,
    /// Why the entry exists.
    pub reason: String,
    /// When the entry was last written.
    pub timestamp: DateTime<Utc>,
    /// When the entry stops being active (`None` = never).
    pub expires_at: Option<DateTime<Utc>>,
    /// Violations recorded, at least 1.
    pub violation_count: u32,
    /// Watch or block.
    pub status: EntryStatus,
}

impl BlacklistEntry {
    /// Check if the entry is active at `now`.
    #[must_use]
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_none_or(|at| now < at)
    }

    /// Check if the entry is an active block at `now`.
    #[must_use]
    pub fn is_blocking_at(&self, now: DateTime<Utc>) -> bool {
        self.status == EntryStatus::Blocked && self.is_active_at(now)
    }

    /// Time left before expiry (`None` if permanent or expired).
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        let left = self.expires_at? - Utc::now();
        left.to_std().ok().filter(|d| !d.is_zero())
    }
}

/// Deny-list of client identities.
///
/// Entries are JSON records in the shared [`CounterStore`]. A violation
/// below the threshold keeps the identity as a watch entry whose count lives
/// in the record and whose provisional TTL restarts with every violation.
/// Reaching the threshold before the watch entry lapses promotes the
/// identity to a full block.
pub struct Blacklist {
    store: Arc<dyn CounterStore>,
    config: BlacklistConfig,
}

impl std::fmt::Debug for Blacklist {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Blacklist")
            .field("backend", &self.store.backend_name())
            .field("config", &self.config)
            .finish()
    }
}

impl Blacklist {
    /// Create a blacklist over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn CounterStore>, config: BlacklistConfig) -> Self {
        Self { store, config }
    }

    /// Active configuration.
    #[must_use]
    pub fn config(&self) -> &BlacklistConfig {
        &self.config
    }

    fn entry_key(ip: &str) -> String {
        format!("{ENTRY_PREFIX}{ip}")
    }

    async fn write(&self, entry: &BlacklistEntry) -> GuardResult<()> {
        let value = serde_json::to_string(entry)?;
        let retention = entry
            .expires_at
            .map(|at| (at - Utc::now()).to_std().unwrap_or_default() + RETENTION_GRACE);
        self.store
            .put_record(&Self::entry_key(&entry.ip), value, retention)
            .await?;
        Ok(())
    }

    fn decode(ip: &str, raw: &str) -> Option<BlacklistEntry> {
        match serde_json::from_str(raw) {
            Ok(entry) => Some(entry),
            Err(err) => {
                warn!(ip, error = %err, "discarding undecodable blacklist entry");
                None
            }
        }
    }

    /// Fetch the active entry for an identity, evicting it if expired.
    pub async fn get(&self, identity: &ClientIdentity) -> GuardResult<Option<BlacklistEntry>> {
        let key = Self::entry_key(identity.as_str());
        let Some(raw) = self.store.get_record(&key).await? else {
            return Ok(None);
        };

        match Self::decode(identity.as_str(), &raw) {
            Some(entry) if entry.is_active_at(Utc::now()) => Ok(Some(entry)),
            _ => {
                self.store.remove_record(&key).await?;
                debug!(ip = %identity, "evicted expired blacklist entry");
                Ok(None)
            }
        }
    }

    /// Check if an identity is actively blocked.
    ///
    /// A store failure reads as not blocked.
    pub async fn is_blacklisted(&self, identity: &ClientIdentity) -> bool {
        match self.get(identity).await {
            Ok(entry) => entry.is_some_and(|e| e.is_blocking_at(Utc::now())),
            Err(err) => {
                warn!(ip = %identity, error = %err, "blacklist lookup failed, allowing");
                false
            }
        }
    }

    /// Block an identity for `ttl`.
    pub async fn add(
        &self,
        identity: &ClientIdentity,
        reason: impl Into<String>,
        ttl: Duration,
    ) -> GuardResult<BlacklistEntry> {
        let now = Utc::now();
        self.insert_block(identity, reason.into(), Some(expiry_after(now, ttl)), 1)
            .await
    }

    /// Block an identity for the configured default TTL.
    pub async fn add_default(
        &self,
        identity: &ClientIdentity,
        reason: impl Into<String>,
    ) -> GuardResult<BlacklistEntry> {
        self.add(identity, reason, self.config.default_ttl).await
    }

    /// Block an identity until explicitly removed.
    pub async fn add_permanent(
        &self,
        identity: &ClientIdentity,
        reason: impl Into<String>,
    ) -> GuardResult<BlacklistEntry> {
        self.insert_block(identity, reason.into(), None, 1).await
    }

    async fn insert_block(
        &self,
        identity: &ClientIdentity,
        reason: String,
        expires_at: Option<DateTime<Utc>>,
        violation_count: u32,
    ) -> GuardResult<BlacklistEntry> {
        let entry = BlacklistEntry {
            ip: identity.to_string(),
            reason,
            timestamp: Utc::now(),
            expires_at,
            violation_count: violation_count.max(1),
            status: EntryStatus::Blocked,
        };
        self.write(&entry).await?;
        info!(ip = %identity, reason = %entry.reason, expires_at = ?entry.expires_at, "identity blacklisted");
        Ok(entry)
    }

    /// Record a violation using the configured threshold.
    pub async fn record_violation(
        &self,
        identity: &ClientIdentity,
        reason: impl Into<String>,
    ) -> GuardResult<bool> {
        self.increment_violation(identity, reason, self.config.violation_threshold)
            .await
    }

    /// Record a violation and promote to a block once `threshold` is reached.
    ///
    /// Returns `true` when the identity is blocked after this call. Below the
    /// threshold the identity is kept as a provisional watch entry that does
    /// not deny traffic.
    pub async fn increment_violation(
        &self,
        identity: &ClientIdentity,
        reason: impl Into<String>,
        threshold: u32,
    ) -> GuardResult<bool> {
        let reason = reason.into();
        let now = Utc::now();
        let mut count = 1;

        if let Some(mut existing) = self.get(identity).await? {
            if existing.is_blocking_at(now) {
                existing.violation_count = existing.violation_count.saturating_add(1);
                existing.reason = reason;
                existing.timestamp = now;
                self.write(&existing).await?;
                return Ok(true);
            }
            // Active watch entry: every violation restarts the provisional TTL.
            count = existing.violation_count.saturating_add(1);
        }

        if count >= threshold.max(1) {
            let expires_at = Some(expiry_after(now, self.config.promotion_ttl));
            self.insert_block(identity, reason, expires_at, count).await?;
            info!(ip = %identity, violations = count, "repeat offender promoted to block");
            return Ok(true);
        }

        let watch = BlacklistEntry {
            ip: identity.to_string(),
            reason,
            timestamp: now,
            expires_at: Some(expiry_after(now, self.config.provisional_ttl)),
            violation_count: count,
            status: EntryStatus::Watch,
        };
        self.write(&watch).await?;
        debug!(ip = %identity, violations = count, threshold, "violation recorded");
        Ok(false)
    }

    /// Remove an identity's entry.
    pub async fn remove(&self, identity: &ClientIdentity) -> GuardResult<bool> {
        let removed = self
            .store
            .remove_record(&Self::entry_key(identity.as_str()))
            .await?;
        if removed {
            info!(ip = %identity, "identity removed from blacklist");
        }
        Ok(removed)
    }

    /// All active entries, newest first.
    pub async fn get_all(&self) -> GuardResult<Vec<BlacklistEntry>> {
        let now = Utc::now();
        let mut entries: Vec<_> = self
            .store
            .list_records(ENTRY_PREFIX)
            .await?
            .into_iter()
            .filter_map(|(key, raw)| Self::decode(&key, &raw))
            .filter(|entry| entry.is_active_at(now))
            .collect();
        entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(entries)
    }

    /// Number of active blocking entries.
    pub async fn blocked_count(&self) -> GuardResult<usize> {
        let now = Utc::now();
        Ok(self
            .get_all()
            .await?
            .iter()
            .filter(|entry| entry.is_blocking_at(now))
            .count())
    }

    /// Evict every expired or undecodable entry, returning how many went.
    pub async fn cleanup(&self) -> GuardResult<usize> {
        let now = Utc::now();
        let mut removed = 0;
        for (key, raw) in self.store.list_records(ENTRY_PREFIX).await? {
            let stale = Self::decode(&key, &raw).is_none_or(|entry| !entry.is_active_at(now));
            if stale && self.store.remove_record(&key).await? {
                removed += 1;
            }
        }
        if removed > 0 {
            info!(removed, "cleaned up expired blacklist entries");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::store::testing::FlakyStore;

    fn blacklist() -> Blacklist {
        Blacklist::new(Arc::new(MemoryStore::new()), BlacklistConfig::default())
    }

    fn ip(raw: &str) -> ClientIdentity {
        ClientIdentity::new(raw)
    }

    #[tokio::test]
    async fn test_add_and_check() {
        let bl = blacklist();
        let target = ip("203.0.113.1");

        assert!(!bl.is_blacklisted(&target).await);
        let entry = bl.add_default(&target, "manual").await.unwrap();
        assert_eq!(entry.violation_count, 1);
        assert_eq!(entry.status, EntryStatus::Blocked);
        assert!(bl.is_blacklisted(&target).await);
        assert!(!bl.is_blacklisted(&ip("203.0.113.2")).await);

        let remaining = entry.remaining().unwrap();
        assert!(remaining > Duration::from_secs(86_000));
    }

    #[tokio::test]
    async fn test_ttl_expiry_evicts_lazily() {
        let bl = blacklist();
        let target = ip("203.0.113.1");

        bl.add(&target, "short", Duration::from_secs(1)).await.unwrap();
        assert!(bl.is_blacklisted(&target).await);

        tokio::time::sleep(Duration::from_millis(1_100)).await;
        assert!(!bl.is_blacklisted(&target).await);
        assert!(bl.get(&target).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_permanent_entry() {
        let bl = blacklist();
        let target = ip("203.0.113.1");

        let entry = bl.add_permanent(&target, "abuse").await.unwrap();
        assert!(entry.expires_at.is_none());
        assert!(entry.remaining().is_none());
        assert!(bl.is_blacklisted(&target).await);
    }

    #[tokio::test]
    async fn test_violation_escalation() {
        let bl = blacklist();
        let target = ip("203.0.113.1");

        assert!(!bl.increment_violation(&target, "rate limit", 3).await.unwrap());
        assert!(!bl.is_blacklisted(&target).await);

        assert!(!bl.increment_violation(&target, "rate limit", 3).await.unwrap());
        let watch = bl.get(&target).await.unwrap().unwrap();
        assert_eq!(watch.status, EntryStatus::Watch);
        assert_eq!(watch.violation_count, 2);
        assert!(!bl.is_blacklisted(&target).await);

        assert!(bl.increment_violation(&target, "rate limit", 3).await.unwrap());
        assert!(bl.is_blacklisted(&target).await);
        let blocked = bl.get(&target).await.unwrap().unwrap();
        assert_eq!(blocked.violation_count, 3);
        assert!(blocked.remaining().unwrap() > Duration::from_secs(86_000));
    }

    #[tokio::test]
    async fn test_violation_on_blocked_entry_stays_blocked() {
        let bl = blacklist();
        let target = ip("203.0.113.1");

        bl.add_default(&target, "manual").await.unwrap();
        assert!(bl.increment_violation(&target, "again", 3).await.unwrap());
        let entry = bl.get(&target).await.unwrap().unwrap();
        assert_eq!(entry.violation_count, 2);
        assert_eq!(entry.status, EntryStatus::Blocked);
    }

    #[tokio::test]
    async fn test_provisional_window_expires() {
        let bl = Blacklist::new(
            Arc::new(MemoryStore::new()),
            BlacklistConfig {
                provisional_ttl: Duration::from_millis(50),
                ..BlacklistConfig::default()
            },
        );
        let target = ip("203.0.113.1");

        bl.record_violation(&target, "x").await.unwrap();
        bl.record_violation(&target, "x").await.unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;

        assert!(bl.get(&target).await.unwrap().is_none());
        assert!(!bl.record_violation(&target, "x").await.unwrap());
        assert_eq!(bl.get(&target).await.unwrap().unwrap().violation_count, 1);
    }

    #[tokio::test]
    async fn test_each_violation_refreshes_provisional_ttl() {
        let bl = Blacklist::new(
            Arc::new(MemoryStore::new()),
            BlacklistConfig {
                provisional_ttl: Duration::from_millis(300),
                ..BlacklistConfig::default()
            },
        );
        let target = ip("203.0.113.1");

        assert!(!bl.increment_violation(&target, "x", 3).await.unwrap());
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!bl.increment_violation(&target, "x", 3).await.unwrap());
        let watch = bl.get(&target).await.unwrap().unwrap();
        assert_eq!(watch.violation_count, 2);
        assert!(watch.remaining().unwrap() > Duration::from_millis(200));

        // Past the first violation's window, inside the refreshed one.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(bl.increment_violation(&target, "x", 3).await.unwrap());
        let blocked = bl.get(&target).await.unwrap().unwrap();
        assert_eq!(blocked.status, EntryStatus::Blocked);
        assert_eq!(blocked.violation_count, 3);
    }

    #[tokio::test]
    async fn test_remove() {
        let bl = blacklist();
        let target = ip("203.0.113.1");

        bl.add_default(&target, "manual").await.unwrap();
        assert!(bl.remove(&target).await.unwrap());
        assert!(!bl.is_blacklisted(&target).await);
        assert!(!bl.remove(&target).await.unwrap());
    }

    #[tokio::test]
    async fn test_get_all_and_cleanup() {
        let bl = blacklist();
        bl.add_default(&ip("203.0.113.1"), "a").await.unwrap();
        bl.add(&ip("203.0.113.2"), "b", Duration::from_millis(20)).await.unwrap();
        bl.increment_violation(&ip("203.0.113.3"), "c", 3).await.unwrap();

        assert_eq!(bl.get_all().await.unwrap().len(), 3);
        assert_eq!(bl.blocked_count().await.unwrap(), 2);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(bl.get_all().await.unwrap().len(), 2);
        assert_eq!(bl.cleanup().await.unwrap(), 1);
        assert_eq!(bl.cleanup().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_corrupt_entry_is_discarded() {
        let store = Arc::new(MemoryStore::new());
        store
            .put_record("bl:203.0.113.1", "{not json".into(), None)
            .await
            .unwrap();
        let bl = Blacklist::new(store, BlacklistConfig::default());

        assert!(!bl.is_blacklisted(&ip("203.0.113.1")).await);
        assert!(bl.get_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_store_failure_fails_open() {
        let bl = Blacklist::new(Arc::new(FlakyStore::new(true)), BlacklistConfig::default());
        let target = ip("203.0.113.1");

        assert!(!bl.is_blacklisted(&target).await);
        assert!(bl.add_default(&target, "x").await.is_err());
    }

    #[test]
    fn test_entry_serialization() {
        let entry = BlacklistEntry {
            ip: "203.0.113.1".into(),
            reason: "test".into(),
            timestamp: Utc::now(),
            expires_at: None,
            violation_count: 1,
            status: EntryStatus::Watch,
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["status"], "watch");
        assert_eq!(json["violation_count"], 1);
    }
}
