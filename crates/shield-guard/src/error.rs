//! Error types for the admission pipeline.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use thiserror::Error;

/// Errors raised by a counter/record storage backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend could not be reached.
    #[error("store connection failed: {0}")]
    Connection(String),

    /// A backend command failed or timed out.
    #[error("store command {command} failed: {reason}")]
    Command {
        /// Command that failed.
        command: &'static str,
        /// Backend-reported reason.
        reason: String,
    },
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_connection_dropped() || err.is_connection_refusal() || err.is_timeout() {
            Self::Connection(err.to_string())
        } else {
            Self::Command {
                command: "redis",
                reason: err.to_string(),
            }
        }
    }
}

/// Result type for storage operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur in admission pipeline operations.
#[derive(Debug, Error)]
pub enum GuardError {
    /// Invalid configuration, caught at startup.
    #[error("configuration error: {0}")]
    Config(String),

    /// Storage backend failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// An external geo/VPN provider failed.
    #[error("provider {provider} failed: {reason}")]
    Provider {
        /// Provider name.
        provider: String,
        /// Failure description.
        reason: String,
    },

    /// A pipeline stage did not finish in time.
    #[error("stage {stage} timed out after {}ms", .after.as_millis())]
    StageTimeout {
        /// Stage name.
        stage: &'static str,
        /// Configured stage budget.
        after: Duration,
    },

    /// Serialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl GuardError {
    /// Build a provider error.
    pub fn provider(provider: impl Into<String>, reason: impl ToString) -> Self {
        Self::Provider {
            provider: provider.into(),
            reason: reason.to_string(),
        }
    }
}

/// Result type for admission pipeline operations.
pub type GuardResult<T> = Result<T, GuardError>;

/// Boxed future returned by provider traits.
pub type GuardFuture<'a, T> = Pin<Box<dyn Future<Output = GuardResult<T>> + Send + 'a>>;
