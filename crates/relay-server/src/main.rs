//! # Relay Server
//!
//! Horizontally scalable realtime pub/sub server with presence channels.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! relay
//!
//! # Run with environment overrides
//! RELAY__PORT=8080 relay
//! ```
//!
//! Replication needs the app list, so it is switched on in `relay.toml`:
//!
//! ```toml
//! [[apps]]
//! id = "A"
//!
//! [replication]
//! enabled = true
//! driver = "websocket"
//! hub_url = "ws://10.0.0.5:6010"
//! expected_peers = 2
//! ```
//!
//! Several processes form a cluster when they share a replication backend.
//! With the websocket driver one of them also sets `replication.hub_listen`
//! and all of them point `replication.hub_url` at it; with the redis driver
//! they all point `replication.redis_url` at the same server.

mod api;
mod config;
mod handlers;
mod metrics;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "relay=debug,tenvis_relay_core=debug,tenvis_relay_transport=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = config::Config::load()?;

    tracing::info!(
        replication = config.replication.enabled,
        apps = config.apps.len(),
        "Starting Relay server on {}:{}",
        config.host,
        config.port
    );

    // Initialize metrics
    metrics::init_metrics();

    // Start the server
    handlers::run_server(config).await?;

    Ok(())
}
