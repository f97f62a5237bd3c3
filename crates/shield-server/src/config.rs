//! Server configuration.

use std::net::SocketAddr;
use std::time::Duration;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// One JSON object per event.
    Json,
}

/// Configuration for the edge server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the HTTP server to.
    pub bind_addr: SocketAddr,
    /// Interval between expired-entry sweeps.
    pub sweep_interval: Duration,
    /// Default page size for audit log queries.
    pub default_log_limit: usize,
    /// Largest page size accepted for audit log queries.
    pub max_log_limit: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            sweep_interval: Duration::from_secs(60),
            default_log_limit: 100,
            max_log_limit: 1000,
        }
    }
}

impl ServerConfig {
    /// Create a new configuration with the specified bind address.
    #[must_use]
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Self::default()
        }
    }

    /// Set the sweep interval.
    #[must_use]
    pub const fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Set the audit log page sizes.
    #[must_use]
    pub const fn with_log_limits(mut self, default_limit: usize, max_limit: usize) -> Self {
        self.default_log_limit = default_limit;
        self.max_log_limit = max_limit;
        self
    }

    /// Clamp a requested page size.
    #[must_use]
    pub fn log_limit(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.default_log_limit)
            .clamp(1, self.max_log_limit.max(1))
    }
}
