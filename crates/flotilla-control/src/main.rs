//! Flotilla control-plane binary.
//!
//! Runs the single-node control plane: state store, evaluation broker,
//! blocked-eval tracker, heartbeats, periodic dispatch and garbage
//! collection.

use tracing::info;
use tracing_subscriber::EnvFilter;

use flotilla_control::{ControlConfig, ControlPlane};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialise tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("flotilla_control=info".parse()?),
        )
        .init();

    info!("flotilla control plane starting");

    // Load configuration
    let config = ControlConfig::load().unwrap_or_else(|e| {
        info!(error = %e, "failed to load config, using defaults");
        ControlConfig::default()
    });

    info!(
        region = %config.server.region,
        visibility_timeout_secs = config.broker.visibility_timeout.as_secs(),
        "configuration loaded"
    );

    let plane = ControlPlane::new(config);

    // Single-node deployment: this server is always the leader.
    plane.set_leader(true);
    info!("control plane serving");

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    plane.set_leader(false);

    Ok(())
}
