//! # shield-server
//!
//! axum front end for the [`shield_guard`] admission pipeline.
//!
//! Every request passes through the admission middleware first. Denied
//! requests get the pipeline's status, JSON error body and headers; allowed
//! requests continue to the router with the decision's headers added to the
//! response.
//!
//! ## Example
//!
//! ```rust,no_run
//! use shield_guard::{AdmissionPipeline, GuardComponents, GuardConfig};
//! use shield_server::{ServerConfig, ShieldServer};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let guard = GuardConfig::from_env()?;
//!     let components = GuardComponents::build(&guard).await?;
//!     let pipeline = AdmissionPipeline::new(guard, components);
//!
//!     let server = ShieldServer::new(ServerConfig::default(), pipeline);
//!     server.serve().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Admin Endpoints
//!
//! Reachable only when the transport peer address is a configured admin
//! address. Forwarded headers never grant access.
//!
//! | Endpoint | Method | Description |
//! |----------|--------|-------------|
//! | `/health` | GET | Liveness and store state |
//! | `/api/security/logs` | GET | Audit entries (`type`, `ip`, `limit`) |
//! | `/api/security/logs/export` | GET | Whole audit buffer as a JSON download |
//! | `/api/security/stats` | GET | Aggregate counters |
//! | `/api/security/blacklist` | GET | Active blacklist entries |
//! | `/api/security/blacklist/{ip}` | POST | Block an identity |
//! | `/api/security/blacklist/{ip}` | DELETE | Unblock an identity |
//! | `/api/security/rate-limit/{ip}` | DELETE | Reset a rate-limit window |

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod routes;
pub mod server;
pub mod state;

// Re-export main types
pub use config::{LogFormat, ServerConfig};
pub use error::{ServerError, ServerResult};
pub use middleware::Admission;
pub use routes::create_router;
pub use server::{ShieldServer, spawn_sweeper, sweep_once};
pub use state::AppState;
