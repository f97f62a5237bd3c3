//! Security audit log.
//!
//! Decisions are kept in a bounded in-memory ring buffer for the admin API,
//! mirrored to `tracing` under the `shield_audit` target, and optionally
//! forwarded to an external ingestion endpoint on a best-effort basis.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::config::AuditConfig;
use crate::error::{GuardError, GuardFuture, GuardResult};

/// Kind of security event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityEventType {
    /// Rate limit exceeded.
    RateLimit,
    /// Non-European traffic denied.
    Geoblock,
    /// VPN, proxy or Tor traffic denied.
    VpnBlock,
    /// Blacklisted or high-risk request denied.
    DdosBlock,
    /// Request flagged for a challenge and allowed.
    Challenge,
    /// Identity added to the blacklist automatically.
    Blacklisted,
}

impl SecurityEventType {
    /// Returns the string representation of this event type.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::RateLimit => "rate_limit",
            Self::Geoblock => "geoblock",
            Self::VpnBlock => "vpn_block",
            Self::DdosBlock => "ddos_block",
            Self::Challenge => "challenge",
            Self::Blacklisted => "blacklisted",
        }
    }

    /// Whether the event records a denied request.
    #[must_use]
    pub const fn is_denial(&self) -> bool {
        matches!(
            self,
            Self::RateLimit | Self::Geoblock | Self::VpnBlock | Self::DdosBlock
        )
    }

    /// Parse the string form used in query parameters.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        [
            Self::RateLimit,
            Self::Geoblock,
            Self::VpnBlock,
            Self::DdosBlock,
            Self::Challenge,
            Self::Blacklisted,
        ]
        .into_iter()
        .find(|t| t.as_str().eq_ignore_ascii_case(raw.trim()))
    }
}

impl fmt::Display for SecurityEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityLogEntry {
    /// Unique entry id.
    pub id: Uuid,
    /// When the event happened.
    pub timestamp: DateTime<Utc>,
    /// Event kind.
    #[serde(rename = "type")]
    pub event_type: SecurityEventType,
    /// Client identity.
    pub ip: String,
    /// Resolved country, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    /// User-Agent header, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    /// Request path.
    pub path: String,
    /// Why the decision was taken.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Risk score at decision time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub risk_score: Option<u8>,
    /// Free-form details.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub metadata: serde_json::Value,
}

impl SecurityLogEntry {
    /// Create an entry stamped with the current time.
    #[must_use]
    pub fn new(event_type: SecurityEventType, ip: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            event_type,
            ip: ip.into(),
            country: None,
            user_agent: None,
            path: path.into(),
            reason: None,
            risk_score: None,
            metadata: serde_json::Value::Null,
        }
    }

    /// Set the country.
    #[must_use]
    pub fn with_country(mut self, country: Option<impl Into<String>>) -> Self {
        self.country = country.map(Into::into);
        self
    }

    /// Set the user agent.
    #[must_use]
    pub fn with_user_agent(mut self, user_agent: Option<impl Into<String>>) -> Self {
        self.user_agent = user_agent.map(Into::into);
        self
    }

    /// Set the reason.
    #[must_use]
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Set the risk score.
    #[must_use]
    pub const fn with_risk_score(mut self, score: u8) -> Self {
        self.risk_score = Some(score);
        self
    }

    /// Add a metadata field.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        if !self.metadata.is_object() {
            self.metadata = serde_json::Value::Object(serde_json::Map::new());
        }
        if let Some(map) = self.metadata.as_object_mut() {
            map.insert(key.into(), value);
        }
        self
    }
}

/// Destination for forwarded audit entries.
pub trait LogSink: Send + Sync {
    /// Deliver one entry.
    fn send(&self, entry: &SecurityLogEntry) -> GuardFuture<'_, ()>;
}

/// Posts entries as JSON to an HTTP ingestion endpoint.
#[derive(Debug, Clone)]
pub struct HttpLogSink {
    client: reqwest::Client,
    url: String,
}

impl HttpLogSink {
    /// Create a sink posting to `url`.
    #[must_use]
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

impl LogSink for HttpLogSink {
    fn send(&self, entry: &SecurityLogEntry) -> GuardFuture<'_, ()> {
        let request = self.client.post(&self.url).json(entry);
        Box::pin(async move {
            let response = request
                .send()
                .await
                .map_err(|e| GuardError::provider("log-ingest", e))?;
            if response.status().is_success() {
                Ok(())
            } else {
                Err(GuardError::provider(
                    "log-ingest",
                    format!("HTTP {}", response.status()),
                ))
            }
        })
    }
}

/// Aggregate counts over the buffered entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditStats {
    /// Entries recorded since startup, including evicted ones.
    pub total_recorded: u64,
    /// Entries currently buffered.
    pub buffered: usize,
    /// Buffered entries per event type.
    pub by_type: BTreeMap<SecurityEventType, usize>,
    /// Distinct identities among buffered entries.
    pub unique_ips: usize,
}

/// Bounded, append-only audit log.
pub struct SecurityAuditLog {
    entries: Mutex<VecDeque<SecurityLogEntry>>,
    capacity: usize,
    total: AtomicU64,
    sink: Option<Arc<dyn LogSink>>,
}

impl fmt::Debug for SecurityAuditLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecurityAuditLog")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .field("has_sink", &self.sink.is_some())
            .finish()
    }
}

impl SecurityAuditLog {
    /// Create a log holding at most `capacity` entries.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
            capacity,
            total: AtomicU64::new(0),
            sink: None,
        }
    }

    /// Create from configuration, attaching an HTTP sink when an ingest URL is set.
    #[must_use]
    pub fn from_config(config: &AuditConfig, client: &reqwest::Client) -> Self {
        let log = Self::new(config.capacity);
        match &config.ingest_url {
            Some(url) => log.with_sink(Arc::new(HttpLogSink::new(client.clone(), url.clone()))),
            None => log,
        }
    }

    /// Forward every recorded entry to `sink`.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Maximum number of buffered entries.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append an entry, evicting the oldest when full.
    pub fn record(&self, entry: SecurityLogEntry) {
        emit(&entry);

        if let Some(sink) = &self.sink {
            forward(Arc::clone(sink), entry.clone());
        }

        self.total.fetch_add(1, Ordering::Relaxed);
        let mut entries = self.entries.lock();
        while entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// Up to `limit` entries, newest first.
    #[must_use]
    pub fn recent(&self, limit: usize) -> Vec<SecurityLogEntry> {
        self.entries.lock().iter().rev().take(limit).cloned().collect()
    }

    /// Entries of one type, newest first.
    #[must_use]
    pub fn by_type(&self, event_type: SecurityEventType, limit: usize) -> Vec<SecurityLogEntry> {
        self.entries
            .lock()
            .iter()
            .rev()
            .filter(|e| e.event_type == event_type)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Entries for one identity, newest first.
    #[must_use]
    pub fn by_ip(&self, ip: &str, limit: usize) -> Vec<SecurityLogEntry> {
        self.entries
            .lock()
            .iter()
            .rev()
            .filter(|e| e.ip == ip)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Counts over the buffer.
    #[must_use]
    pub fn stats(&self) -> AuditStats {
        let entries = self.entries.lock();
        let mut by_type = BTreeMap::new();
        let mut ips = std::collections::HashSet::new();
        for entry in entries.iter() {
            *by_type.entry(entry.event_type).or_insert(0) += 1;
            ips.insert(entry.ip.as_str());
        }
        AuditStats {
            total_recorded: self.total.load(Ordering::Relaxed),
            buffered: entries.len(),
            by_type,
            unique_ips: ips.len(),
        }
    }

    /// Serialize the buffer, oldest first.
    pub fn export_json(&self) -> GuardResult<String> {
        let entries = self.entries.lock();
        let snapshot: Vec<&SecurityLogEntry> = entries.iter().collect();
        Ok(serde_json::to_string_pretty(&snapshot)?)
    }

    /// Number of buffered entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Check if the buffer is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Drop every buffered entry.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

fn emit(entry: &SecurityLogEntry) {
    let event_type = entry.event_type.as_str();
    let reason = entry.reason.as_deref().unwrap_or_default();
    if entry.event_type.is_denial() {
        tracing::warn!(
            target: "shield_audit",
            id = %entry.id,
            event_type,
            ip = %entry.ip,
            path = %entry.path,
            country = ?entry.country,
            risk_score = ?entry.risk_score,
            reason,
            "request denied"
        );
    } else {
        tracing::info!(
            target: "shield_audit",
            id = %entry.id,
            event_type,
            ip = %entry.ip,
            path = %entry.path,
            risk_score = ?entry.risk_score,
            reason,
            "security event"
        );
    }
}

fn forward(sink: Arc<dyn LogSink>, entry: SecurityLogEntry) {
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        debug!(id = %entry.id, "no runtime, audit entry not forwarded");
        return;
    };
    runtime.spawn(async move {
        if let Err(err) = sink.send(&entry).await {
            debug!(id = %entry.id, error = %err, "audit entry forwarding failed");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn entry(event_type: SecurityEventType, ip: &str) -> SecurityLogEntry {
        SecurityLogEntry::new(event_type, ip, "/")
    }

    #[test]
    fn test_ring_buffer_evicts_oldest() {
        let log = SecurityAuditLog::new(3);
        for i in 0..5 {
            log.record(entry(SecurityEventType::RateLimit, &format!("10.0.0.{i}")));
        }

        assert_eq!(log.len(), 3);
        let recent = log.recent(10);
        assert_eq!(recent[0].ip, "10.0.0.4");
        assert_eq!(recent[2].ip, "10.0.0.2");
        assert_eq!(log.stats().total_recorded, 5);
    }

    #[test]
    fn test_filters() {
        let log = SecurityAuditLog::new(100);
        log.record(entry(SecurityEventType::RateLimit, "a"));
        log.record(entry(SecurityEventType::Geoblock, "b"));
        log.record(entry(SecurityEventType::RateLimit, "b"));

        assert_eq!(log.by_type(SecurityEventType::RateLimit, 10).len(), 2);
        assert_eq!(log.by_type(SecurityEventType::VpnBlock, 10).len(), 0);
        assert_eq!(log.by_ip("b", 10).len(), 2);
        assert_eq!(log.by_ip("b", 1)[0].event_type, SecurityEventType::RateLimit);
        assert_eq!(log.recent(2).len(), 2);
    }

    #[test]
    fn test_stats() {
        let log = SecurityAuditLog::new(100);
        log.record(entry(SecurityEventType::DdosBlock, "a"));
        log.record(entry(SecurityEventType::DdosBlock, "b"));
        log.record(entry(SecurityEventType::Challenge, "a"));

        let stats = log.stats();
        assert_eq!(stats.buffered, 3);
        assert_eq!(stats.unique_ips, 2);
        assert_eq!(stats.by_type.get(&SecurityEventType::DdosBlock), Some(&2));
        assert_eq!(stats.by_type.get(&SecurityEventType::Challenge), Some(&1));
    }

    #[test]
    fn test_export_and_clear() {
        let log = SecurityAuditLog::new(10);
        log.record(
            entry(SecurityEventType::VpnBlock, "a")
                .with_reason("vpn detected")
                .with_risk_score(70)
                .with_metadata("confidence", serde_json::json!(90)),
        );

        let json: serde_json::Value = serde_json::from_str(&log.export_json().unwrap()).unwrap();
        assert_eq!(json[0]["type"], "vpn_block");
        assert_eq!(json[0]["reason"], "vpn detected");
        assert_eq!(json[0]["metadata"]["confidence"], 90);
        assert!(json[0].get("country").is_none());

        log.clear();
        assert!(log.is_empty());
    }

    #[test]
    fn test_event_type_parse() {
        assert_eq!(SecurityEventType::parse("geoblock"), Some(SecurityEventType::Geoblock));
        assert_eq!(SecurityEventType::parse("RATE_LIMIT"), Some(SecurityEventType::RateLimit));
        assert_eq!(SecurityEventType::parse("nope"), None);
        assert!(SecurityEventType::DdosBlock.is_denial());
        assert!(!SecurityEventType::Challenge.is_denial());
    }

    struct ChannelSink(tokio::sync::mpsc::UnboundedSender<Uuid>);

    impl LogSink for ChannelSink {
        fn send(&self, entry: &SecurityLogEntry) -> GuardFuture<'_, ()> {
            let id = entry.id;
            Box::pin(async move {
                self.0
                    .send(id)
                    .map_err(|e| GuardError::Internal(e.to_string()))
            })
        }
    }

    #[tokio::test]
    async fn test_sink_receives_entries() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let log = SecurityAuditLog::new(10).with_sink(Arc::new(ChannelSink(tx)));
        let recorded = entry(SecurityEventType::Geoblock, "a");
        let id = recorded.id;
        log.record(recorded);

        let forwarded = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap();
        assert_eq!(forwarded, Some(id));
    }

    #[test]
    fn test_record_without_runtime_does_not_panic() {
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let log = SecurityAuditLog::new(10).with_sink(Arc::new(ChannelSink(tx)));
        log.record(entry(SecurityEventType::Geoblock, "a"));
        assert_eq!(log.len(), 1);
    }
}
