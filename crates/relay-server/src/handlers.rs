//! Connection handlers for Relay server.
//!
//! This module builds the shared server state, handles the WebSocket
//! connection lifecycle, and routes client frames to the channel manager.

use crate::api;
use crate::config::{Config, ReplicationConfig, ReplicationDriver};
use crate::metrics::{self, ConnectionGauge, Flow};
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use bytes::BytesMut;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use relay_protocol::{codec, Frame, NodeId};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tenvis_relay_core::message::SUBSCRIPTION_SUCCEEDED;
use tenvis_relay_core::{
    ChannelManager, ConnectionHandle, ConnectionId, CoordinatorConfig, ManagerConfig, Message,
    ReplicationCoordinator,
};
use tenvis_relay_transport::{
    HubServer, MemoryHub, RedisTransport, ReplicationTransport, StaticPeers, WebSocketTransport,
};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// Error codes carried by `Error` frames.
pub mod codes {
    pub const SUBSCRIBE_FAILED: u16 = 1002;
    pub const PUBLISH_REJECTED: u16 = 1003;
    pub const INVALID_FRAME: u16 = 1004;
    pub const UNSUBSCRIBE_FAILED: u16 = 1008;
}

/// Shared server state.
pub struct AppState {
    /// Owner of every local channel.
    pub manager: Arc<ChannelManager>,
    /// Server configuration.
    pub config: Config,
    /// Open WebSocket connections.
    connections: AtomicUsize,
}

impl AppState {
    /// Build the state, connecting to the replication backend if enabled.
    ///
    /// # Errors
    ///
    /// Returns an error if the replication transport cannot be set up.
    pub async fn build(config: Config) -> Result<Arc<Self>> {
        let manager_config = ManagerConfig {
            max_subscriptions_per_connection: config.limits.max_subscriptions_per_connection,
            auto_delete_empty_channels: !config.limits.retain_empty_channels,
        };

        let manager = if config.replication.enabled {
            let coordinator = ReplicationCoordinator::start(
                CoordinatorConfig {
                    node_id: config
                        .replication
                        .node_id
                        .as_deref()
                        .map_or_else(NodeId::generate, NodeId::new),
                    topic_prefix: config.replication.topic_prefix.clone(),
                    query_timeout: config.replication.query_timeout(),
                },
                replication_transport(&config).await?,
                Arc::new(replication_peers(&config.replication)),
            );
            let manager = Arc::new(ChannelManager::with_replication(manager_config, coordinator));
            manager
                .start_replication(&config.app_ids())
                .await
                .context("Failed to subscribe to replication topics")?;
            manager
        } else {
            Arc::new(ChannelManager::new(manager_config))
        };

        Ok(Arc::new(Self {
            manager,
            config,
            connections: AtomicUsize::new(0),
        }))
    }

    /// Number of open WebSocket connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }
}

async fn replication_transport(config: &Config) -> Result<Arc<dyn ReplicationTransport>> {
    let replication = &config.replication;
    match replication.driver {
        ReplicationDriver::Memory => Ok(Arc::new(MemoryHub::new().transport())),
        ReplicationDriver::Websocket => {
            if let Some(listen) = &replication.hub_listen {
                let addr = listen
                    .parse::<SocketAddr>()
                    .with_context(|| format!("Invalid hub listen address: {listen}"))?;
                let hub = HubServer::bind(addr).await?;
                tokio::spawn(async move {
                    if let Err(e) = hub.run().await {
                        error!(error = %e, "Replication hub stopped");
                    }
                });
            }
            let transport = WebSocketTransport::connect(&replication.hub_url)
                .await
                .with_context(|| format!("Failed to connect to hub {}", replication.hub_url))?;
            Ok(Arc::new(transport))
        }
        ReplicationDriver::Redis => {
            let transport = RedisTransport::connect(&replication.redis_url)
                .await
                .with_context(|| format!("Failed to connect to Redis {}", replication.redis_url))?;
            Ok(Arc::new(transport))
        }
    }
}

/// Heartbeat interval announced in `Connected`, saturating at `u32::MAX` ms.
fn heartbeat_hint(config: &Config) -> u32 {
    u32::try_from(config.heartbeat.interval_ms).unwrap_or(u32::MAX)
}

/// How many peers cluster queries wait for.
fn replication_peers(replication: &ReplicationConfig) -> StaticPeers {
    match replication.driver {
        // A hub private to this process has nobody else on it.
        ReplicationDriver::Memory => StaticPeers::exactly(0),
        ReplicationDriver::Websocket | ReplicationDriver::Redis => {
            StaticPeers::from(replication.expected_peers)
        }
    }
}

/// Build the HTTP router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/app/:app_id", get(ws_handler))
        .route("/health", get(health_handler))
        .merge(api::routes())
        .with_state(state)
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let state = AppState::build(config.clone()).await?;

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!(error = %e, "Metrics disabled");
        }
        metrics::spawn_stats_poller(
            &state.manager,
            Duration::from_secs(config.metrics.stats_interval_secs.max(1)),
        );
    }

    let app = router(state);

    // Bind and serve
    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr).await?;

    info!("Relay server listening on {}", addr);
    info!("WebSocket endpoint: ws://{}/app/{{app_id}}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let replication = state.manager.coordinator().map(|c| {
        serde_json::json!({
            "node_id": c.node_id(),
            "transport": c.transport_name(),
            "healthy": c.is_healthy(),
        })
    });
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "connections": state.connection_count(),
        "replication": replication,
    }))
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(app_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Response {
    if !state.config.allows_app(&app_id) {
        debug!(app = %app_id, "Rejecting connection for unknown app");
        return StatusCode::NOT_FOUND.into_response();
    }
    if state.connection_count() >= state.config.limits.max_connections {
        warn!(app = %app_id, "Connection limit reached");
        metrics::record_error("connection_limit");
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    ws.max_message_size(state.config.limits.max_message_size)
        .on_upgrade(move |socket| handle_websocket(socket, app_id, state))
}

/// One accepted connection.
struct Session {
    app_id: String,
    handle: ConnectionHandle,
}

type WsSender = SplitSink<WebSocket, WsMessage>;

/// Handle a WebSocket connection.
async fn handle_websocket(socket: WebSocket, app_id: String, state: Arc<AppState>) {
    let _gauge = ConnectionGauge::open();
    state.connections.fetch_add(1, Ordering::Relaxed);

    let (handle, mut outbound) =
        ConnectionHandle::channel(ConnectionId::generate(), state.config.limits.connection_buffer);
    let session = Session {
        app_id,
        handle: handle.clone(),
    };
    let connection_id = handle.id().clone();
    state.manager.connect(&session.app_id, handle);

    debug!(app = %session.app_id, connection = %connection_id, "WebSocket connected");

    let (mut sender, mut receiver) = socket.split();

    let connected = Frame::connected(connection_id.as_str(), heartbeat_hint(&state.config));
    if send_frame(&mut sender, &connected).await.is_err() {
        error!(connection = %connection_id, "Failed to send Connected frame");
        finish(&state, &session);
        return;
    }

    let idle_timeout = Duration::from_millis(state.config.heartbeat.timeout_ms);
    let mut deadline = tokio::time::Instant::now() + idle_timeout;

    // Read buffer for partial frames
    let mut read_buffer = BytesMut::with_capacity(4096);

    loop {
        tokio::select! {
            biased;

            // Events queued for this connection
            Some(message) = outbound.recv() => {
                let frame = Frame::Publish {
                    id: None,
                    channel: message.channel.clone(),
                    event: message.event.clone(),
                    payload: message.payload.to_vec(),
                };
                if send_frame(&mut sender, &frame).await.is_err() {
                    break;
                }
            }

            // Receive from WebSocket
            msg = receiver.next() => {
                deadline = tokio::time::Instant::now() + idle_timeout;
                let data = match msg {
                    Some(Ok(WsMessage::Binary(data))) => data,
                    // Treat text as binary
                    Some(Ok(WsMessage::Text(text))) => text.into_bytes(),
                    Some(Ok(WsMessage::Ping(data))) => {
                        if sender.send(WsMessage::Pong(data)).await.is_err() {
                            break;
                        }
                        continue;
                    }
                    Some(Ok(WsMessage::Pong(_))) => continue,
                    Some(Ok(WsMessage::Close(_))) => {
                        debug!(connection = %connection_id, "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(connection = %connection_id, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(connection = %connection_id, "WebSocket stream ended");
                        break;
                    }
                };

                let start = Instant::now();
                read_buffer.extend_from_slice(&data);
                if let Err(e) = process_buffer(&mut read_buffer, &session, &state, &mut sender).await {
                    debug!(connection = %connection_id, error = %e, "Closing connection");
                    break;
                }
                metrics::record_frame_time(start.elapsed());
            }

            _ = tokio::time::sleep_until(deadline) => {
                debug!(connection = %connection_id, "Heartbeat timeout");
                break;
            }
        }
    }

    finish(&state, &session);
}

fn finish(state: &AppState, session: &Session) {
    let left = state
        .manager
        .disconnect(&session.app_id, session.handle.id());
    state.connections.fetch_sub(1, Ordering::Relaxed);
    debug!(
        app = %session.app_id,
        connection = %session.handle.id(),
        channels = left,
        "WebSocket disconnected"
    );
}

/// Decode and handle every complete frame in the buffer.
async fn process_buffer(
    buffer: &mut BytesMut,
    session: &Session,
    state: &Arc<AppState>,
    sender: &mut WsSender,
) -> Result<()> {
    loop {
        match codec::decode_from::<Frame>(buffer) {
            Ok(Some(frame)) => handle_frame(&frame, session, state, sender).await?,
            Ok(None) => {
                if buffer.len() > state.config.limits.max_message_size {
                    buffer.clear();
                    metrics::record_error("frame_too_large");
                    send_frame(sender, &Frame::error(0, codes::INVALID_FRAME, "Frame too large")).await?;
                    anyhow::bail!("frame exceeds max_message_size");
                }
                return Ok(());
            }
            Err(e) => {
                warn!(connection = %session.handle.id(), error = %e, "Undecodable frame");
                metrics::record_error("decode");
                buffer.clear();
                send_frame(sender, &Frame::error(0, codes::INVALID_FRAME, e.to_string())).await?;
                return Ok(());
            }
        }
    }
}

/// Handle a decoded frame.
async fn handle_frame(
    frame: &Frame,
    session: &Session,
    state: &Arc<AppState>,
    sender: &mut WsSender,
) -> Result<()> {
    let connection_id = session.handle.id();
    let app_id = session.app_id.as_str();

    match frame {
        Frame::Subscribe {
            id,
            channel,
            presence,
        } => {
            debug!(connection = %connection_id, channel = %channel, "Subscribe request");

            match state
                .manager
                .subscribe(app_id, &session.handle, channel, presence.clone())
            {
                Ok(outcome) => {
                    metrics::record_subscription();
                    send_frame(sender, &Frame::ack(*id)).await?;
                    if let Some(members) = outcome.members {
                        let payload = serde_json::to_vec(&members)?;
                        send_frame(sender, &Frame::event(channel.clone(), SUBSCRIPTION_SUCCEEDED, payload)).await?;
                    }
                }
                Err(e) => {
                    warn!(connection = %connection_id, error = %e, "Subscribe failed");
                    metrics::record_error("subscribe");
                    send_frame(sender, &Frame::error(*id, codes::SUBSCRIBE_FAILED, e.to_string())).await?;
                }
            }
        }

        Frame::Unsubscribe { id, channel } => {
            debug!(connection = %connection_id, channel = %channel, "Unsubscribe request");

            let response = match state.manager.unsubscribe(app_id, connection_id, channel) {
                Ok(()) => Frame::ack(*id),
                Err(e) => Frame::error(*id, codes::UNSUBSCRIBE_FAILED, e.to_string()),
            };
            send_frame(sender, &response).await?;
        }

        Frame::Publish {
            id,
            channel,
            event,
            payload,
        } => {
            if let Some(reason) = publish_rejection(state, session, channel) {
                debug!(connection = %connection_id, channel = %channel, reason, "Publish rejected");
                send_frame(sender, &Frame::error(id.unwrap_or(0), codes::PUBLISH_REJECTED, reason)).await?;
                return Ok(());
            }

            let mut message = Message::new(channel.clone(), payload.clone());
            if let Some(evt) = event {
                message = message.with_event(evt.clone());
            }

            let count = state.manager.publish(app_id, message, Some(connection_id));
            metrics::record_message(Flow::Client, payload.len());

            // Send ack if requested
            if let Some(req_id) = id {
                send_frame(sender, &Frame::ack(*req_id)).await?;
            }

            debug!(connection = %connection_id, channel = %channel, recipients = count, "Published");
        }

        Frame::Ping { timestamp } => {
            send_frame(sender, &Frame::pong(*timestamp)).await?;
        }

        Frame::Pong { .. } => {}

        _ => {
            warn!(connection = %connection_id, frame = frame.kind(), "Unexpected frame from client");
        }
    }

    Ok(())
}

fn publish_rejection(state: &AppState, session: &Session, channel: &str) -> Option<&'static str> {
    if !state.config.client_messages_enabled(&session.app_id) {
        return Some("Client events are disabled for this app");
    }
    if !state
        .manager
        .is_subscribed(&session.app_id, session.handle.id(), channel)
    {
        return Some("Not subscribed to channel");
    }
    None
}

/// Send a frame to the WebSocket.
async fn send_frame(sender: &mut WsSender, frame: &Frame) -> Result<()> {
    let data = codec::encode(frame)?;
    metrics::record_message(Flow::Outbound, data.len());
    sender.send(WsMessage::Binary(data.to_vec())).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use serde_json::Value;
    use tenvis_relay_transport::PeerView;
    use tokio_tungstenite::{connect_async, tungstenite::Message as ClientMessage, MaybeTlsStream, WebSocketStream};

    type Client = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

    async fn serve(config: Config) -> SocketAddr {
        let state = AppState::build(config).await.unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, router(state)).await;
        });
        addr
    }

    async fn send(client: &mut Client, frame: &Frame) {
        let data = codec::encode(frame).unwrap();
        client.send(ClientMessage::Binary(data.to_vec())).await.unwrap();
    }

    async fn recv(client: &mut Client) -> Frame {
        loop {
            let message = tokio::time::timeout(Duration::from_secs(2), client.next())
                .await
                .expect("timed out waiting for a frame")
                .unwrap()
                .unwrap();
            if let ClientMessage::Binary(data) = message {
                return codec::decode(&data).unwrap();
            }
        }
    }

    async fn open(addr: SocketAddr, app_id: &str) -> Client {
        let (mut client, _) = connect_async(format!("ws://{addr}/app/{app_id}")).await.unwrap();
        assert!(matches!(recv(&mut client).await, Frame::Connected { .. }));
        client
    }

    #[test]
    fn test_heartbeat_hint_saturates() {
        let mut config = Config::default();
        assert_eq!(heartbeat_hint(&config), 30_000);

        config.heartbeat.interval_ms = u64::from(u32::MAX) + 1;
        assert_eq!(heartbeat_hint(&config), u32::MAX);
    }

    #[test]
    fn test_memory_driver_never_waits_for_peers() {
        let mut replication = ReplicationConfig::default();
        replication.expected_peers = Some(3);
        assert_eq!(replication_peers(&replication).peer_count(), Some(0));

        replication.driver = ReplicationDriver::Websocket;
        assert_eq!(replication_peers(&replication).peer_count(), Some(3));

        replication.driver = ReplicationDriver::Redis;
        replication.expected_peers = None;
        assert_eq!(replication_peers(&replication).peer_count(), None);
    }

    #[tokio::test]
    async fn test_subscribe_and_publish() {
        let addr = serve(Config::default()).await;
        let mut alice = open(addr, "A").await;
        let mut bob = open(addr, "A").await;

        send(&mut alice, &Frame::subscribe(1, "chat")).await;
        assert_eq!(recv(&mut alice).await, Frame::ack(1));
        send(&mut bob, &Frame::subscribe(2, "chat")).await;
        assert_eq!(recv(&mut bob).await, Frame::ack(2));

        send(
            &mut alice,
            &Frame::Publish {
                id: Some(3),
                channel: "chat".to_string(),
                event: Some("client-message".to_string()),
                payload: b"hello".to_vec(),
            },
        )
        .await;
        assert_eq!(recv(&mut alice).await, Frame::ack(3));
        assert_eq!(
            recv(&mut bob).await,
            Frame::event("chat", "client-message", b"hello".to_vec())
        );
    }

    #[tokio::test]
    async fn test_presence_subscribe_lists_members() {
        let addr = serve(Config::default()).await;
        let mut alice = open(addr, "A").await;

        send(&mut alice, &Frame::subscribe_presence(1, "presence-room", "u1", None)).await;
        assert_eq!(recv(&mut alice).await, Frame::ack(1));

        let Frame::Publish { event, payload, .. } = recv(&mut alice).await else {
            panic!("expected subscription_succeeded");
        };
        assert_eq!(event.as_deref(), Some(SUBSCRIPTION_SUCCEEDED));
        let members: Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(members["presence"]["count"], 1);
        assert_eq!(members["presence"]["ids"][0], "u1");
    }

    #[tokio::test]
    async fn test_publish_requires_subscription_and_permission() {
        let config = Config {
            apps: vec![AppConfig {
                id: "quiet".to_string(),
                enable_client_messages: false,
            }],
            ..Config::default()
        };
        let addr = serve(config).await;
        let mut client = open(addr, "quiet").await;

        send(&mut client, &Frame::subscribe(1, "chat")).await;
        assert_eq!(recv(&mut client).await, Frame::ack(1));

        send(
            &mut client,
            &Frame::Publish {
                id: Some(2),
                channel: "chat".to_string(),
                event: None,
                payload: b"x".to_vec(),
            },
        )
        .await;
        assert!(matches!(
            recv(&mut client).await,
            Frame::Error { id: 2, code: codes::PUBLISH_REJECTED, .. }
        ));
    }

    #[tokio::test]
    async fn test_unknown_app_is_rejected() {
        let config = Config {
            apps: vec![AppConfig {
                id: "A".to_string(),
                enable_client_messages: true,
            }],
            ..Config::default()
        };
        let addr = serve(config).await;
        assert!(connect_async(format!("ws://{addr}/app/B")).await.is_err());
    }

    #[tokio::test]
    async fn test_unsupported_channel_kind() {
        let addr = serve(Config::default()).await;
        let mut client = open(addr, "A").await;

        send(&mut client, &Frame::subscribe(7, "private-encrypted-x")).await;
        assert!(matches!(
            recv(&mut client).await,
            Frame::Error { id: 7, code: codes::SUBSCRIBE_FAILED, .. }
        ));
    }
}
