//! Prometheus metrics for Relay.
//!
//! Per-connection traffic is counted inline by the handlers. Channel and
//! subscription gauges come from [`ChannelManager::stats`], sampled by
//! [`spawn_stats_poller`]; the core itself never emits metrics.

use anyhow::{Context, Result};
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tenvis_relay_core::{ChannelManager, ManagerStats};
use tokio::task::JoinHandle;
use tracing::{info, trace};

/// Metric names.
pub mod names {
    pub const CONNECTIONS_OPENED: &str = "relay_connections_opened_total";
    pub const CONNECTIONS_OPEN: &str = "relay_connections_open";
    pub const MESSAGES: &str = "relay_messages_total";
    pub const MESSAGE_BYTES: &str = "relay_message_bytes_total";
    pub const SUBSCRIBES: &str = "relay_subscribes_total";
    pub const MEMBER_QUERIES: &str = "relay_member_queries_total";
    pub const ERRORS: &str = "relay_errors_total";
    pub const FRAME_SECONDS: &str = "relay_frame_handling_seconds";
    pub const APPS: &str = "relay_apps";
    pub const CHANNELS: &str = "relay_channels";
    pub const SUBSCRIPTIONS: &str = "relay_subscriptions";
    pub const EVENTS_PUBLISHED: &str = "relay_events_published";
    pub const EVENTS_DELIVERED: &str = "relay_events_delivered";
}

const COUNTERS: &[(&str, &str)] = &[
    (names::CONNECTIONS_OPENED, "WebSocket connections accepted"),
    (names::MESSAGES, "Messages by flow"),
    (names::MESSAGE_BYTES, "Message bytes by flow"),
    (names::SUBSCRIBES, "Successful channel subscribes"),
    (names::MEMBER_QUERIES, "Member count queries by scope"),
    (names::ERRORS, "Errors by kind"),
];

const GAUGES: &[(&str, &str)] = &[
    (names::CONNECTIONS_OPEN, "Open WebSocket connections"),
    (names::APPS, "Apps with local state"),
    (names::CHANNELS, "Local channels"),
    (names::SUBSCRIPTIONS, "Local subscriptions"),
    (names::EVENTS_PUBLISHED, "Events published on this node since start"),
    (names::EVENTS_DELIVERED, "Events queued to local connections since start"),
];

/// Where a message was counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Published by a client connection.
    Client,
    /// Triggered through the HTTP API.
    Api,
    /// Written to a client socket.
    Outbound,
}

impl Flow {
    /// The `flow` label value.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Flow::Client => "client",
            Flow::Api => "api",
            Flow::Outbound => "outbound",
        }
    }
}

/// Register metric descriptions.
pub fn init_metrics() {
    for &(name, help) in COUNTERS {
        metrics::describe_counter!(name, help);
    }
    for &(name, help) in GAUGES {
        metrics::describe_gauge!(name, help);
    }
    metrics::describe_histogram!(names::FRAME_SECONDS, "Time spent handling one client read");
    info!("Metrics initialized");
}

/// Serve Prometheus metrics on `port`, all interfaces.
///
/// # Errors
///
/// Returns an error if the exporter cannot be installed or bound.
pub fn start_metrics_server(port: u16) -> Result<SocketAddr> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .with_context(|| format!("Failed to start metrics exporter on {addr}"))?;
    info!(%addr, "Metrics exporter listening");
    Ok(addr)
}

/// Count one message of `bytes` bytes.
pub fn record_message(flow: Flow, bytes: usize) {
    counter!(names::MESSAGES, "flow" => flow.label()).increment(1);
    counter!(names::MESSAGE_BYTES, "flow" => flow.label()).increment(bytes as u64);
}

/// Record how long one client read took to handle.
pub fn record_frame_time(elapsed: Duration) {
    histogram!(names::FRAME_SECONDS).record(elapsed.as_secs_f64());
}

/// Count a successful subscribe.
pub fn record_subscription() {
    counter!(names::SUBSCRIBES).increment(1);
}

/// Count a member count query answered by the API.
pub fn record_member_query(replicated: bool) {
    let scope = if replicated { "cluster" } else { "local" };
    counter!(names::MEMBER_QUERIES, "scope" => scope).increment(1);
}

/// Count an error of the given kind.
pub fn record_error(kind: &'static str) {
    counter!(names::ERRORS, "kind" => kind).increment(1);
}

/// Export a manager statistics snapshot.
pub fn record_stats(stats: &ManagerStats) {
    gauge!(names::APPS).set(stats.app_count as f64);
    gauge!(names::CHANNELS).set(stats.channel_count as f64);
    gauge!(names::SUBSCRIPTIONS).set(stats.subscription_count as f64);
    gauge!(names::EVENTS_PUBLISHED).set(stats.messages_published as f64);
    gauge!(names::EVENTS_DELIVERED).set(stats.messages_delivered as f64);
}

/// Sample the manager's statistics every `interval`.
///
/// The task ends once the manager is dropped.
pub fn spawn_stats_poller(manager: &Arc<ChannelManager>, interval: Duration) -> JoinHandle<()> {
    let manager = Arc::downgrade(manager);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let Some(manager) = manager.upgrade() else {
                break;
            };
            let stats = manager.stats();
            trace!(?stats, "Exporting manager statistics");
            record_stats(&stats);
        }
    })
}

/// Keeps the open connection gauge in step with a socket's lifetime.
pub struct ConnectionGauge(());

impl ConnectionGauge {
    /// Count a newly opened connection.
    #[must_use]
    pub fn open() -> Self {
        counter!(names::CONNECTIONS_OPENED).increment(1);
        gauge!(names::CONNECTIONS_OPEN).increment(1.0);
        Self(())
    }
}

impl Drop for ConnectionGauge {
    fn drop(&mut self) {
        gauge!(names::CONNECTIONS_OPEN).decrement(1.0);
    }
}
