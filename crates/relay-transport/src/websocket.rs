//! WebSocket hub transport.
//!
//! One process runs a [`HubServer`]; every node connects to it with a
//! [`WebSocketTransport`]. Each WebSocket message carries exactly one
//! length-prefixed [`BusFrame`]. The hub routes publishes to every link
//! subscribed to the topic, including the publishing link itself.
//!
//! A node whose link drops keeps redialing the hub with [`Backoff`] and
//! re-sends a `Subscribe` for every topic it still listens on once the new
//! link is up. Publishes made while the link is down fail with
//! [`TransportError::Unavailable`].

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use relay_protocol::{codec, BusFrame};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinSet;
use tokio_tungstenite::{
    accept_async, connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, trace, warn};

use crate::backoff::Backoff;
use crate::traits::{Envelope, EnvelopeSink, ReplicationTransport, TransportError};

/// Frames the hub buffers per node link before dropping publishes for it.
pub const LINK_QUEUE: usize = 4096;

/// Frames a node buffers for the hub before publishes fail.
pub const OUTBOUND_QUEUE: usize = 4096;

type LinkId = u64;
type HubStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type TopicSinks = DashMap<String, Vec<EnvelopeSink>>;

#[derive(Default)]
struct HubState {
    links: DashMap<LinkId, mpsc::Sender<Message>>,
    topics: DashMap<String, HashSet<LinkId>>,
    next_link: AtomicU64,
}

impl HubState {
    fn apply(&self, link: LinkId, data: &[u8]) {
        match codec::decode::<BusFrame>(data) {
            Ok(BusFrame::Subscribe { topic }) => {
                self.topics.entry(topic).or_default().insert(link);
            }
            Ok(BusFrame::Unsubscribe { topic }) => {
                if let Some(mut links) = self.topics.get_mut(&topic) {
                    links.remove(&link);
                }
            }
            Ok(frame @ BusFrame::Publish { .. }) => self.route(frame.topic(), &frame),
            Err(e) => warn!(link, error = %e, "Hub dropped malformed frame"),
        }
    }

    fn route(&self, topic: &str, frame: &BusFrame) {
        let targets: Vec<LinkId> = match self.topics.get(topic) {
            Some(links) => links.iter().copied().collect(),
            None => return,
        };

        let data = match codec::encode(frame) {
            Ok(data) => data,
            Err(e) => {
                warn!(topic = %topic, error = %e, "Hub failed to encode publish");
                return;
            }
        };

        for link in targets {
            let Some(tx) = self.links.get(&link) else {
                continue;
            };
            if let Err(TrySendError::Full(_)) = tx.try_send(Message::Binary(data.to_vec())) {
                warn!(link, topic = %topic, "Hub link backlogged, dropping publish");
            }
        }
        trace!(topic = %topic, "Hub routed publish");
    }

    fn drop_link(&self, link: LinkId) {
        self.links.remove(&link);
        for mut entry in self.topics.iter_mut() {
            entry.value_mut().remove(&link);
        }
        self.topics.retain(|_, links| !links.is_empty());
    }
}

/// Read-only view of a running hub.
#[derive(Clone)]
pub struct HubHandle {
    state: Arc<HubState>,
}

impl HubHandle {
    /// Number of connected node links.
    #[must_use]
    pub fn link_count(&self) -> usize {
        self.state.links.len()
    }

    /// Number of links subscribed to a topic.
    #[must_use]
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.state.topics.get(topic).map(|l| l.len()).unwrap_or(0)
    }
}

/// The central topic router nodes connect to.
pub struct HubServer {
    listener: TcpListener,
    state: Arc<HubState>,
}

impl HubServer {
    /// Bind the hub to an address.
    ///
    /// # Errors
    ///
    /// Returns an error if binding to the address fails.
    pub async fn bind(addr: SocketAddr) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr).await?;
        info!("Replication hub listening on {}", addr);
        Ok(Self {
            listener,
            state: Arc::new(HubState::default()),
        })
    }

    /// Get the local address this hub is bound to.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr().ok()
    }

    /// Get a handle for inspecting the hub while it runs.
    #[must_use]
    pub fn handle(&self) -> HubHandle {
        HubHandle {
            state: Arc::clone(&self.state),
        }
    }

    /// Accept node links until the listener fails.
    ///
    /// Every link lives inside this future: dropping or aborting it closes
    /// all of them.
    ///
    /// # Errors
    ///
    /// Returns an error if accepting a TCP connection fails.
    pub async fn run(self) -> Result<(), TransportError> {
        let mut links = JoinSet::new();
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, addr) = accepted?;
                    links.spawn(serve_link(stream, addr, Arc::clone(&self.state)));
                }
                Some(_) = links.join_next() => {}
            }
        }
    }
}

async fn serve_link(stream: TcpStream, addr: SocketAddr, state: Arc<HubState>) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("Hub handshake with {} failed: {}", addr, e);
            return;
        }
    };

    let link = state.next_link.fetch_add(1, Ordering::Relaxed);
    let (mut sink, mut stream) = ws_stream.split();
    let (tx, mut rx) = mpsc::channel::<Message>(LINK_QUEUE);
    state.links.insert(link, tx);
    debug!(link, peer = %addr, "Node linked to hub");

    loop {
        tokio::select! {
            Some(message) = rx.recv() => {
                if sink.send(message).await.is_err() {
                    break;
                }
            }
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Binary(data))) => state.apply(link, &data),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(link, error = %e, "Hub link error");
                    break;
                }
            },
        }
    }

    state.drop_link(link);
    debug!(link, peer = %addr, "Node unlinked from hub");
}

/// A node's link to a [`HubServer`].
pub struct WebSocketTransport {
    outbound: mpsc::Sender<Message>,
    sinks: Arc<TopicSinks>,
    connected: Arc<AtomicBool>,
}

impl WebSocketTransport {
    /// Connect to a hub, e.g. `ws://10.0.0.5:6380`.
    ///
    /// Only this first dial is reported; later link drops are redialed in
    /// the background.
    ///
    /// # Errors
    ///
    /// Returns an error if the hub cannot be reached.
    pub async fn connect(url: &str) -> Result<Self, TransportError> {
        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|e| TransportError::Unavailable(format!("{}: {}", url, e)))?;
        info!("Connected to replication hub at {}", url);

        let (outbound, rx) = mpsc::channel::<Message>(OUTBOUND_QUEUE);
        let sinks: Arc<TopicSinks> = Arc::new(DashMap::new());
        let connected = Arc::new(AtomicBool::new(true));

        tokio::spawn(maintain_link(
            url.to_string(),
            ws_stream,
            rx,
            Arc::clone(&sinks),
            Arc::clone(&connected),
        ));

        Ok(Self {
            outbound,
            sinks,
            connected,
        })
    }

    fn send_frame(&self, frame: &BusFrame) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::Acquire) {
            return Err(TransportError::Unavailable("hub link is down".into()));
        }
        let data = codec::encode(frame)?;
        self.outbound
            .try_send(Message::Binary(data.to_vec()))
            .map_err(|e| match e {
                TrySendError::Full(_) => TransportError::Unavailable("hub link backlog is full".into()),
                TrySendError::Closed(_) => TransportError::Unavailable("hub link task stopped".into()),
            })
    }
}

enum SessionEnd {
    /// The hub went away; redial.
    Lost,
    /// The transport was dropped.
    Closed,
}

async fn maintain_link(
    url: String,
    first: HubStream,
    mut outbound: mpsc::Receiver<Message>,
    sinks: Arc<TopicSinks>,
    connected: Arc<AtomicBool>,
) {
    let mut backoff = Backoff::default();
    let mut next = Some(first);
    loop {
        let ws_stream = match next.take() {
            Some(ws_stream) => ws_stream,
            None => match connect_async(url.as_str()).await {
                Ok((ws_stream, _)) => {
                    info!("Reconnected to replication hub at {}", url);
                    backoff.reset();
                    ws_stream
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    debug!(url = %url, error = %e, retry_ms = delay.as_millis() as u64, "Replication hub unreachable");
                    if !idle(&mut outbound, delay).await {
                        return;
                    }
                    continue;
                }
            },
        };

        match run_session(ws_stream, &mut outbound, &sinks, &connected).await {
            SessionEnd::Closed => return,
            SessionEnd::Lost => {
                connected.store(false, Ordering::Release);
                warn!("Replication hub link lost, reconnecting to {}", url);
            }
        }
    }
}

/// Wait out a redial delay. Frames queued meanwhile belong to the dead link
/// and are discarded. Returns `false` once the transport is dropped.
async fn idle(outbound: &mut mpsc::Receiver<Message>, delay: Duration) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            () = &mut sleep => return true,
            queued = outbound.recv() => {
                if queued.is_none() {
                    return false;
                }
            }
        }
    }
}

async fn run_session(
    ws_stream: HubStream,
    outbound: &mut mpsc::Receiver<Message>,
    sinks: &TopicSinks,
    connected: &AtomicBool,
) -> SessionEnd {
    let (mut sink, mut stream) = ws_stream.split();

    // Mark the link up before snapshotting topics: a subscribe racing this
    // replay is either in the snapshot or sent by `subscribe` itself, and the
    // hub treats a repeated Subscribe as a no-op.
    connected.store(true, Ordering::Release);
    let topics: Vec<String> = sinks.iter().map(|entry| entry.key().clone()).collect();
    for topic in topics {
        let data = match codec::encode(&BusFrame::Subscribe { topic }) {
            Ok(data) => data,
            Err(e) => {
                warn!(error = %e, "Failed to encode subscription replay");
                continue;
            }
        };
        if sink.send(Message::Binary(data.to_vec())).await.is_err() {
            return SessionEnd::Lost;
        }
    }

    loop {
        tokio::select! {
            queued = outbound.recv() => match queued {
                Some(message) => {
                    if let Err(e) = sink.send(message).await {
                        warn!(error = %e, "Replication hub write failed");
                        return SessionEnd::Lost;
                    }
                }
                None => {
                    let _ = sink.close().await;
                    return SessionEnd::Closed;
                }
            },
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Binary(data))) => match codec::decode::<BusFrame>(&data) {
                    Ok(BusFrame::Publish { topic, payload }) => {
                        dispatch(sinks, topic, Bytes::from(payload));
                    }
                    Ok(other) => {
                        debug!(topic = %other.topic(), "Ignoring non-publish frame from hub");
                    }
                    Err(e) => warn!(error = %e, "Dropped malformed frame from hub"),
                },
                Some(Ok(Message::Close(_))) | None => return SessionEnd::Lost,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(error = %e, "Replication hub read failed");
                    return SessionEnd::Lost;
                }
            },
        }
    }
}

fn dispatch(sinks: &TopicSinks, topic: String, payload: Bytes) {
    if let Some(mut targets) = sinks.get_mut(&topic) {
        targets.retain(|sink| {
            sink.send(Envelope {
                topic: topic.clone(),
                payload: payload.clone(),
            })
            .is_ok()
        });
    }
}

#[async_trait]
impl ReplicationTransport for WebSocketTransport {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), TransportError> {
        self.send_frame(&BusFrame::Publish {
            topic: topic.to_string(),
            payload: payload.to_vec(),
        })
    }

    async fn subscribe(&self, topic: &str, sink: EnvelopeSink) -> Result<(), TransportError> {
        let first = {
            let mut entry = self.sinks.entry(topic.to_string()).or_default();
            entry.push(sink);
            entry.len() == 1
        };
        if first {
            // While the link is down the reconnect replays this topic.
            if let Err(e) = self.send_frame(&BusFrame::Subscribe {
                topic: topic.to_string(),
            }) {
                debug!(topic = %topic, error = %e, "Subscription deferred until the hub link is back");
            }
        }
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        if self.sinks.remove(topic).is_some() {
            // A link that is down forgets the topic on its own.
            if let Err(e) = self.send_frame(&BusFrame::Unsubscribe {
                topic: topic.to_string(),
            }) {
                debug!(topic = %topic, error = %e, "Unsubscribe not sent, hub link is down");
            }
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "websocket"
    }

    fn is_healthy(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}
