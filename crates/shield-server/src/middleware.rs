//! Admission and admin-gate middleware.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Json;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::header::{HeaderMap, HeaderName, HeaderValue};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use shield_guard::{AdmissionDecision, ClientIdentity, ErrorBody, RequestInfo};
use tracing::{debug, warn};

use crate::error::ServerError;
use crate::state::AppState;

/// Outcome of admission attached to allowed requests.
#[derive(Debug, Clone)]
pub struct Admission {
    /// Identity the pipeline keyed on.
    pub identity: ClientIdentity,
    /// Whether the risk stage asked for a challenge.
    pub challenge_required: bool,
    /// Risk score, when the risk stage ran.
    pub risk_score: Option<u8>,
}

/// Build the pipeline's view of an axum request.
pub fn request_info(request: &Request) -> RequestInfo {
    let mut info = RequestInfo::new(request.method().as_str(), request.uri().path());
    for (name, value) in request.headers() {
        if let Ok(value) = value.to_str() {
            info.insert_header(name.as_str(), value);
        }
    }
    if let Some(ConnectInfo(addr)) = request.extensions().get::<ConnectInfo<SocketAddr>>() {
        info = info.with_peer(addr.ip());
    }
    info
}

fn apply_headers(headers: &mut HeaderMap, pairs: &[(String, String)]) {
    for (name, value) in pairs {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => debug!(header = %name, "skipping unrepresentable header"),
        }
    }
}

fn denial_response(decision: &AdmissionDecision) -> Response {
    let status = StatusCode::from_u16(decision.status).unwrap_or(StatusCode::FORBIDDEN);
    let body = decision
        .body
        .clone()
        .unwrap_or_else(|| ErrorBody::new("blocked", "request denied"));
    let mut response = (status, Json(body)).into_response();
    apply_headers(response.headers_mut(), &decision.headers);
    response
}

/// Run the admission pipeline in front of every route.
pub async fn admission(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Response {
    let info = request_info(&request);
    let decision = state.pipeline().evaluate(&info).await;
    state.record_outcome(decision.allowed);

    if !decision.allowed {
        warn!(
            ip = %decision.identity,
            path = %info.path,
            stage = ?decision.stage,
            status = decision.status,
            "request denied"
        );
        return denial_response(&decision);
    }

    request.extensions_mut().insert(Admission {
        identity: decision.identity.clone(),
        challenge_required: decision.challenge_required,
        risk_score: decision.risk_score,
    });

    let mut response = next.run(request).await;
    apply_headers(response.headers_mut(), &decision.headers);
    response
}

/// Transport peer of a request, with IPv4-mapped addresses unwrapped.
pub fn peer_identity(request: &Request) -> Option<ClientIdentity> {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| ClientIdentity::from(addr.ip().to_canonical()))
}

/// Reject callers whose transport peer is not an admin address.
///
/// Forwarded headers are client-controlled and never grant admin access.
pub async fn require_admin(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    match peer_identity(&request) {
        Some(peer) if state.guard_config().is_admin(peer.as_str()) => next.run(request).await,
        peer => {
            warn!(
                peer = peer.as_ref().map_or("unknown", ClientIdentity::as_str),
                path = %request.uri().path(),
                "admin route refused"
            );
            ServerError::Forbidden("admin access required".into()).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    #[test]
    fn test_request_info_from_axum_request() {
        let mut request = Request::builder()
            .method("POST")
            .uri("/login?next=/home")
            .header("User-Agent", "curl/8.0")
            .header("X-Forwarded-For", "81.2.69.10")
            .body(Body::empty())
            .unwrap();
        request
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([127, 0, 0, 1], 4000))));

        let info = request_info(&request);
        assert_eq!(info.method, "POST");
        assert_eq!(info.path, "/login");
        assert_eq!(info.user_agent(), Some("curl/8.0"));
        assert_eq!(info.peer_addr, Some("127.0.0.1".parse().unwrap()));
        assert_eq!(ClientIdentity::from_request(&info).as_str(), "81.2.69.10");
    }

    #[test]
    fn test_peer_identity_ignores_forwarded_headers() {
        let mut request = Request::builder()
            .uri("/health")
            .header("X-Forwarded-For", "10.0.0.1")
            .body(Body::empty())
            .unwrap();
        assert!(peer_identity(&request).is_none());

        request.extensions_mut().insert(ConnectInfo(
            "[::ffff:81.2.69.99]:5555".parse::<SocketAddr>().unwrap(),
        ));
        assert_eq!(peer_identity(&request).unwrap().as_str(), "81.2.69.99");
    }

    #[test]
    fn test_apply_headers_skips_invalid_names() {
        let mut headers = HeaderMap::new();
        apply_headers(
            &mut headers,
            &[
                ("Retry-After".to_string(), "30".to_string()),
                ("bad header".to_string(), "x".to_string()),
            ],
        );
        assert_eq!(headers.len(), 1);
        assert_eq!(headers["retry-after"], "30");
    }
}
