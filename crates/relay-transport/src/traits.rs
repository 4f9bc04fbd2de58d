//! Replication transport traits.
//!
//! These traits define what the cluster layer needs from a pub/sub backend.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

/// A payload received on a subscribed topic.
#[derive(Debug, Clone)]
pub struct Envelope {
    /// Topic the payload was published on.
    pub topic: String,
    /// Opaque payload bytes.
    pub payload: Bytes,
}

/// Where a transport pushes payloads for a subscribed topic.
pub type EnvelopeSink = mpsc::UnboundedSender<Envelope>;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The backend cannot be reached.
    #[error("Transport unavailable: {0}")]
    Unavailable(String),

    /// Protocol error on the link.
    #[error("Protocol error: {0}")]
    Protocol(#[from] relay_protocol::ProtocolError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A publish/subscribe link between all nodes of a deployment.
///
/// Publishing is fire-and-forget: success means the backend accepted the
/// payload, not that any node received it. Delivery reaches every process
/// subscribed to the topic, the publisher included.
#[async_trait]
pub trait ReplicationTransport: Send + Sync {
    /// Publish a payload on a topic.
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), TransportError>;

    /// Deliver every future payload on `topic` into `sink`.
    ///
    /// A closed sink is dropped silently by the transport.
    async fn subscribe(&self, topic: &str, sink: EnvelopeSink) -> Result<(), TransportError>;

    /// Stop delivering `topic` to every sink this transport registered.
    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError>;

    /// Get the transport name (e.g., "memory", "websocket").
    fn name(&self) -> &'static str;

    /// Check if the transport is healthy.
    fn is_healthy(&self) -> bool {
        true
    }
}

/// A view of how many other nodes are expected to answer cluster queries.
pub trait PeerView: Send + Sync {
    /// Number of peers besides this node, or `None` when unknown.
    fn peer_count(&self) -> Option<usize>;
}

/// A peer count fixed at startup from configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticPeers {
    peers: Option<usize>,
}

impl StaticPeers {
    /// Peers are unknown; queries always wait for their deadline.
    #[must_use]
    pub fn unknown() -> Self {
        Self { peers: None }
    }

    /// Exactly `count` other nodes are expected.
    #[must_use]
    pub fn exactly(count: usize) -> Self {
        Self { peers: Some(count) }
    }
}

impl From<Option<usize>> for StaticPeers {
    fn from(peers: Option<usize>) -> Self {
        Self { peers }
    }
}

impl PeerView for StaticPeers {
    fn peer_count(&self) -> Option<usize> {
        self.peers
    }
}
