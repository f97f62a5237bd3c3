//! Route configuration for the edge server.

use std::sync::Arc;

use axum::middleware::from_fn_with_state;
use axum::routing::{Router, delete, get, post};
use tower_http::trace::TraceLayer;

use crate::handlers::{
    block_ip, export_logs, get_stats, health_check, list_blacklist, list_logs, reset_rate_limit,
    root, unblock_ip,
};
use crate::middleware::{admission, require_admin};
use crate::state::AppState;

/// Create the router: admin API plus application routes, all behind admission.
pub fn create_router(state: Arc<AppState>) -> Router {
    let admin_routes = Router::new()
        .route("/health", get(health_check))
        .route("/api/security/logs", get(list_logs))
        .route("/api/security/logs/export", get(export_logs))
        .route("/api/security/stats", get(get_stats))
        .route("/api/security/blacklist", get(list_blacklist))
        .route("/api/security/blacklist/{ip}", post(block_ip).delete(unblock_ip))
        .route("/api/security/rate-limit/{ip}", delete(reset_rate_limit))
        .route_layer(from_fn_with_state(state.clone(), require_admin));

    Router::new()
        .route("/", get(root))
        .merge(admin_routes)
        .layer(from_fn_with_state(state.clone(), admission))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}
