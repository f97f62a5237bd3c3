//! Shared state for the edge server.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use shield_guard::{AdmissionPipeline, GuardComponents, GuardConfig};

use crate::config::ServerConfig;

/// State shared by the middleware, the admin handlers and the sweeper.
#[derive(Debug)]
pub struct AppState {
    config: Arc<ServerConfig>,
    pipeline: AdmissionPipeline,
    allowed: AtomicU64,
    denied: AtomicU64,
    start_time: Instant,
}

impl AppState {
    /// Create the state around a built pipeline.
    pub fn new(config: ServerConfig, pipeline: AdmissionPipeline) -> Self {
        Self {
            config: Arc::new(config),
            pipeline,
            allowed: AtomicU64::new(0),
            denied: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Admission pipeline.
    pub fn pipeline(&self) -> &AdmissionPipeline {
        &self.pipeline
    }

    /// Pipeline configuration.
    pub fn guard_config(&self) -> &GuardConfig {
        self.pipeline.config()
    }

    /// Pipeline components.
    pub fn components(&self) -> &GuardComponents {
        self.pipeline.components()
    }

    /// Count one admission outcome.
    pub fn record_outcome(&self, allowed: bool) {
        let counter = if allowed { &self.allowed } else { &self.denied };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Requests allowed since startup.
    pub fn allowed_count(&self) -> u64 {
        self.allowed.load(Ordering::Relaxed)
    }

    /// Requests denied since startup.
    pub fn denied_count(&self) -> u64 {
        self.denied.load(Ordering::Relaxed)
    }

    /// Seconds since startup.
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;

    use shield_guard::{
        AdmissionPipeline, FallbackStore, GeoResolver, GuardComponents, GuardConfig,
        SecurityAuditLog, VpnResolver,
    };

    use super::AppState;
    use crate::config::ServerConfig;

    pub(crate) const ADMIN_IP: &str = "10.0.0.1";

    /// State over memory-only components with no external providers.
    pub(crate) fn make_test_state(config: GuardConfig) -> Arc<AppState> {
        let components = GuardComponents::from_parts(
            &config,
            Arc::new(FallbackStore::memory_only()),
            GeoResolver::new(&config.geo, None, None),
            VpnResolver::new(&config.vpn, Vec::new()),
            SecurityAuditLog::new(config.audit.capacity),
        );
        Arc::new(AppState::new(
            ServerConfig::default(),
            AdmissionPipeline::new(config, components),
        ))
    }

    pub(crate) fn admin_config() -> GuardConfig {
        GuardConfig::builder().admin_ip(ADMIN_IP).build()
    }
}
