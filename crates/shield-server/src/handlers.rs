//! HTTP request handlers for the admin API.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use serde::{Deserialize, Serialize};
use shield_guard::{
    AuditStats, BlacklistEntry, ClientIdentity, CounterStore, SecurityEventType, SecurityLogEntry,
};

use crate::error::{ServerError, ServerResult};
use crate::state::AppState;

/// Query parameters for audit log filtering.
#[derive(Debug, Default, Deserialize)]
pub struct LogQuery {
    /// Filter by event type.
    #[serde(rename = "type")]
    pub event_type: Option<String>,
    /// Filter by identity.
    pub ip: Option<String>,
    /// Limit number of results.
    pub limit: Option<usize>,
}

/// Body of a manual block.
#[derive(Debug, Deserialize)]
pub struct BlockRequest {
    /// Why the identity is blocked.
    pub reason: String,
    /// Block duration; the configured default when absent.
    pub ttl_secs: Option<u64>,
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Status message.
    pub status: String,
    /// Server uptime in seconds.
    pub uptime_secs: u64,
    /// Backend currently holding counters.
    pub store_backend: String,
    /// Whether the external store is configured.
    pub store_external: bool,
    /// Whether calls are being served from memory after a failure.
    pub store_degraded: bool,
}

/// Counters for the store.
#[derive(Debug, Serialize)]
pub struct StoreStats {
    /// Whether the external store is configured.
    pub external: bool,
    /// Whether the store is degraded.
    pub degraded: bool,
    /// Failure episodes since startup.
    pub fallback_episodes: u64,
}

/// Security statistics response.
#[derive(Debug, Serialize)]
pub struct StatsResponse {
    /// Audit log summary.
    pub audit: AuditStats,
    /// Active blacklist entries, watch entries included.
    pub blacklist_entries: usize,
    /// Active blocking entries.
    pub blacklist_blocked: usize,
    /// Store state.
    pub store: StoreStats,
    /// Requests admitted since startup.
    pub requests_allowed: u64,
    /// Requests denied since startup.
    pub requests_denied: u64,
    /// Server uptime in seconds.
    pub uptime_secs: u64,
}

fn parse_identity(raw: &str) -> ServerResult<ClientIdentity> {
    raw.parse::<IpAddr>()
        .map(ClientIdentity::from)
        .map_err(|_| ServerError::InvalidRequest(format!("invalid IP address: {raw}")))
}

/// Handle GET / - placeholder application root.
pub async fn root() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "service": "shield", "status": "ok" }))
}

/// Handle GET /health - liveness plus store state.
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let store = &state.components().store;
    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_secs: state.uptime_secs(),
        store_backend: store.backend_name().to_string(),
        store_external: store.has_primary(),
        store_degraded: store.is_degraded(),
    })
}

/// Handle GET /api/security/logs - filtered audit entries, newest first.
pub async fn list_logs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LogQuery>,
) -> ServerResult<Json<Vec<SecurityLogEntry>>> {
    let limit = state.config().log_limit(query.limit);
    let event_type = query
        .event_type
        .as_deref()
        .map(|raw| {
            SecurityEventType::parse(raw)
                .ok_or_else(|| ServerError::InvalidRequest(format!("unknown event type: {raw}")))
        })
        .transpose()?;
    let audit = &state.components().audit;

    let entries = match (event_type, query.ip.as_deref()) {
        (Some(event_type), Some(ip)) => audit
            .by_ip(ip, audit.capacity())
            .into_iter()
            .filter(|entry| entry.event_type == event_type)
            .take(limit)
            .collect(),
        (Some(event_type), None) => audit.by_type(event_type, limit),
        (None, Some(ip)) => audit.by_ip(ip, limit),
        (None, None) => audit.recent(limit),
    };
    Ok(Json(entries))
}

/// Handle GET /api/security/logs/export - the whole buffer as a JSON download.
pub async fn export_logs(State(state): State<Arc<AppState>>) -> ServerResult<impl IntoResponse> {
    let body = state.components().audit.export_json()?;
    Ok((
        [
            (header::CONTENT_TYPE, "application/json"),
            (
                header::CONTENT_DISPOSITION,
                "attachment; filename=\"security-log.json\"",
            ),
        ],
        body,
    ))
}

/// Handle GET /api/security/stats - aggregate counters.
pub async fn get_stats(State(state): State<Arc<AppState>>) -> ServerResult<Json<StatsResponse>> {
    let components = state.components();
    let entries = components.blacklist.get_all().await?;
    let blocked = components.blacklist.blocked_count().await?;

    Ok(Json(StatsResponse {
        audit: components.audit.stats(),
        blacklist_entries: entries.len(),
        blacklist_blocked: blocked,
        store: StoreStats {
            external: components.store.has_primary(),
            degraded: components.store.is_degraded(),
            fallback_episodes: components.store.fallback_episodes(),
        },
        requests_allowed: state.allowed_count(),
        requests_denied: state.denied_count(),
        uptime_secs: state.uptime_secs(),
    }))
}

/// Handle GET /api/security/blacklist - active entries.
pub async fn list_blacklist(
    State(state): State<Arc<AppState>>,
) -> ServerResult<Json<Vec<BlacklistEntry>>> {
    let entries = state.components().blacklist.get_all().await?;
    Ok(Json(entries))
}

/// Handle POST /api/security/blacklist/{ip} - block an identity.
pub async fn block_ip(
    State(state): State<Arc<AppState>>,
    Path(ip): Path<String>,
    Json(body): Json<BlockRequest>,
) -> ServerResult<(StatusCode, Json<BlacklistEntry>)> {
    let identity = parse_identity(&ip)?;
    if body.reason.trim().is_empty() {
        return Err(ServerError::InvalidRequest("reason must not be empty".into()));
    }

    let blacklist = &state.components().blacklist;
    let entry = match body.ttl_secs {
        Some(0) => return Err(ServerError::InvalidRequest("ttl_secs must be positive".into())),
        Some(secs) => {
            blacklist
                .add(&identity, body.reason.as_str(), Duration::from_secs(secs))
                .await?
        }
        None => blacklist.add_default(&identity, body.reason.as_str()).await?,
    };

    state.components().audit.record(
        SecurityLogEntry::new(SecurityEventType::Blacklisted, identity.as_str(), "/api/security/blacklist")
            .with_reason(format!("manual: {}", body.reason))
            .with_metadata("source", serde_json::Value::from("admin")),
    );
    Ok((StatusCode::CREATED, Json(entry)))
}

/// Handle DELETE /api/security/blacklist/{ip} - unblock an identity.
pub async fn unblock_ip(
    State(state): State<Arc<AppState>>,
    Path(ip): Path<String>,
) -> ServerResult<StatusCode> {
    let identity = parse_identity(&ip)?;
    if state.components().blacklist.remove(&identity).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ServerError::NotFound("blacklist entry".into(), ip))
    }
}

/// Handle DELETE /api/security/rate-limit/{ip} - reset a window.
pub async fn reset_rate_limit(
    State(state): State<Arc<AppState>>,
    Path(ip): Path<String>,
) -> ServerResult<StatusCode> {
    let identity = parse_identity(&ip)?;
    state.components().rate_limiter.reset(&identity).await;
    Ok(StatusCode::NO_CONTENT)
}
