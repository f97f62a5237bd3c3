//! Edge server implementation.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use shield_guard::AdmissionPipeline;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::routes::create_router;
use crate::state::AppState;

/// HTTP front end running every request through the admission pipeline.
///
/// Also owns the background sweeper that evicts expired counters and
/// blacklist entries.
#[derive(Debug, Clone)]
pub struct ShieldServer {
    state: Arc<AppState>,
}

impl ShieldServer {
    /// Create a server around a built pipeline.
    #[must_use]
    pub fn new(config: ServerConfig, pipeline: AdmissionPipeline) -> Self {
        Self {
            state: Arc::new(AppState::new(config, pipeline)),
        }
    }

    /// Get the shared state.
    #[must_use]
    pub fn state(&self) -> Arc<AppState> {
        self.state.clone()
    }

    /// Create the router without starting the server.
    pub fn router(&self) -> axum::Router {
        create_router(self.state.clone())
    }

    /// Listen on the configured address until a fatal error.
    ///
    /// # Errors
    ///
    /// Returns an error if binding to the address fails.
    pub async fn serve(&self) -> ServerResult<()> {
        self.serve_with_shutdown(std::future::pending()).await
    }

    /// Listen on the configured address until `shutdown` completes.
    ///
    /// # Errors
    ///
    /// Returns an error if binding to the address fails.
    pub async fn serve_with_shutdown<F>(&self, shutdown: F) -> ServerResult<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let addr = self.state.config().bind_addr;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::BindFailed(addr, e))?;
        let local = listener.local_addr().unwrap_or(addr);

        info!(addr = %local, "shield server listening");

        let sweeper = spawn_sweeper(self.state.clone(), self.state.config().sweep_interval);
        let router = create_router(self.state.clone());

        let served = axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown)
        .await;

        sweeper.abort();
        served.map_err(|e| ServerError::Internal(e.to_string()))?;

        info!("shield server shut down");
        Ok(())
    }
}

/// Run [`sweep_once`] every `interval` until the task is aborted.
pub fn spawn_sweeper(state: Arc<AppState>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            sweep_once(&state).await;
        }
    })
}

/// Evict expired counters and blacklist entries.
///
/// Returns how many counters and entries were removed.
pub async fn sweep_once(state: &AppState) -> (usize, usize) {
    let components = state.components();
    let counters = components.store.sweep();
    let entries = match components.blacklist.cleanup().await {
        Ok(removed) => removed,
        Err(err) => {
            warn!(error = %err, "blacklist cleanup failed");
            0
        }
    };
    debug!(counters, entries, "sweep complete");
    (counters, entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use shield_guard::ClientIdentity;

    use crate::state::testing::{admin_config, make_test_state};

    fn make_test_server(addr: SocketAddr) -> ShieldServer {
        let state = make_test_state(admin_config());
        let pipeline = state.pipeline().clone();
        ShieldServer::new(ServerConfig::new(addr), pipeline)
    }

    #[tokio::test]
    async fn test_router_creation() {
        let server = make_test_server(SocketAddr::from(([127, 0, 0, 1], 0)));
        let _router = server.router();
        assert_eq!(server.state().allowed_count(), 0);
    }

    #[tokio::test]
    async fn test_serve_with_shutdown() {
        let server = make_test_server(SocketAddr::from(([127, 0, 0, 1], 0)));
        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

        let server_handle = tokio::spawn(async move {
            server
                .serve_with_shutdown(async move {
                    let _ = shutdown_rx.await;
                })
                .await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        let _ = shutdown_tx.send(());

        let result = tokio::time::timeout(Duration::from_secs(1), server_handle).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_bind_conflict_reports_address() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = taken.local_addr().unwrap();
        let server = make_test_server(addr);

        let result = server.serve().await;
        assert!(matches!(result, Err(ServerError::BindFailed(a, _)) if a == addr));
    }

    #[tokio::test]
    async fn test_sweep_removes_expired_blacklist_entries() {
        let state = make_test_state(admin_config());
        state
            .components()
            .blacklist
            .add(&ClientIdentity::new("81.2.69.40"), "short", Duration::from_millis(50))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        let (_, entries) = sweep_once(&state).await;
        assert_eq!(entries, 1);
        assert!(state.components().blacklist.get_all().await.unwrap().is_empty());
    }
}
