//! shield-server - edge admission front end
//!
//! Runs every inbound request through the admission pipeline and exposes the
//! admin security API.

use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;
use shield_guard::{AdmissionPipeline, GuardComponents, GuardConfig};
use shield_server::{LogFormat, ServerConfig, ShieldServer};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser)]
#[command(name = "shield-server")]
#[command(about = "Edge security admission server")]
#[command(version)]
struct Cli {
    /// Address to listen on
    #[arg(long, env = "SHIELD_BIND", default_value = "0.0.0.0:8080")]
    bind: SocketAddr,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Seconds between expired-entry sweeps
    #[arg(long, default_value_t = 60)]
    sweep_interval_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("shield_server=info,shield_guard=info,shield_audit=info"));
    let registry = tracing_subscriber::registry().with(filter);
    match cli.log_format {
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
        LogFormat::Text => registry.with(fmt::layer()).init(),
    }

    let guard_config = GuardConfig::from_env()?;
    let components = GuardComponents::build(&guard_config).await?;
    let pipeline = AdmissionPipeline::new(guard_config, components);

    let config = ServerConfig::new(cli.bind)
        .with_sweep_interval(Duration::from_secs(cli.sweep_interval_secs));
    info!(bind = %config.bind_addr, "starting shield-server");

    ShieldServer::new(config, pipeline)
        .serve_with_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}
