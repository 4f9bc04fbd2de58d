//! Cluster replication coordinator.
//!
//! The coordinator is the only piece of the core that talks to the
//! replication transport. It does two things:
//!
//! - **Event fan-out** - local events are queued on an outbound pump that
//!   publishes them to the app's events topic in order. The queue holds at
//!   most [`OUTBOUND_QUEUE`] messages; past that, new ones are dropped with
//!   a warning rather than stalling the publishing connection.
//! - **Member count queries** - a query is broadcast to every node, replies
//!   are merged by addition into a [`PendingQuery`], and the caller gets the
//!   merged counts once every expected peer answered or the deadline passed.
//!
//! Decoding inbound traffic and dispatching it is the manager's job; the
//! coordinator only exposes [`ReplicationCoordinator::accept_reply`] and
//! [`ReplicationCoordinator::answer_query`] for it.

use crate::message::Message;
use crate::topic::{topic_for, TopicPurpose, DEFAULT_TOPIC_PREFIX};
use bytes::Bytes;
use dashmap::DashMap;
use relay_protocol::codec;
use relay_protocol::{NodeId, ProtocolError, QueryId, ReplicationMessage};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tenvis_relay_transport::{EnvelopeSink, PeerView, ReplicationTransport, TransportError};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// Default deadline for cluster queries.
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_millis(2000);

/// Messages the outbound pump buffers while the transport is slow.
pub const OUTBOUND_QUEUE: usize = 8192;

/// Coordinator configuration.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// This node's identity on the transport.
    pub node_id: NodeId,
    /// Deployment-wide topic prefix.
    pub topic_prefix: String,
    /// How long a member count query waits for peers.
    pub query_timeout: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            node_id: NodeId::generate(),
            topic_prefix: DEFAULT_TOPIC_PREFIX.to_string(),
            query_timeout: DEFAULT_QUERY_TIMEOUT,
        }
    }
}

/// An outstanding member count query.
#[derive(Debug)]
pub struct PendingQuery {
    app_id: String,
    deadline: Instant,
    responders: HashSet<NodeId>,
    expected: Option<usize>,
    counts: HashMap<String, u64>,
    resolve: oneshot::Sender<HashMap<String, u64>>,
}

impl PendingQuery {
    /// Nodes that answered so far.
    #[must_use]
    pub fn responder_count(&self) -> usize {
        self.responders.len()
    }

    /// When the query resolves with whatever it has.
    #[must_use]
    pub fn deadline(&self) -> Instant {
        self.deadline
    }
}

/// Removes a query from the arena if its caller goes away before it
/// resolves.
struct PendingGuard<'a> {
    pending: &'a DashMap<QueryId, PendingQuery>,
    query_id: QueryId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.query_id);
    }
}

/// Request/response and fan-out over the replication transport.
pub struct ReplicationCoordinator {
    config: CoordinatorConfig,
    transport: Arc<dyn ReplicationTransport>,
    peers: Arc<dyn PeerView>,
    pending: DashMap<QueryId, PendingQuery>,
    next_query: AtomicU64,
    outbound: mpsc::Sender<(String, Bytes)>,
}

impl ReplicationCoordinator {
    /// Create a coordinator and spawn its outbound pump.
    ///
    /// Must be called from within a tokio runtime. The pump stops once the
    /// coordinator is dropped.
    #[must_use]
    pub fn start(
        config: CoordinatorConfig,
        transport: Arc<dyn ReplicationTransport>,
        peers: Arc<dyn PeerView>,
    ) -> Arc<Self> {
        let (outbound, mut queue) = mpsc::channel::<(String, Bytes)>(OUTBOUND_QUEUE);

        let pump_transport = Arc::clone(&transport);
        tokio::spawn(async move {
            while let Some((topic, payload)) = queue.recv().await {
                if let Err(e) = pump_transport.publish(&topic, payload).await {
                    warn!(topic = %topic, error = %e, "Failed to publish replication message");
                }
            }
            trace!("Replication pump stopped");
        });

        debug!(
            node = %config.node_id,
            transport = transport.name(),
            timeout_ms = config.query_timeout.as_millis() as u64,
            "Replication coordinator started"
        );

        Arc::new(Self {
            config,
            transport,
            peers,
            pending: DashMap::new(),
            next_query: AtomicU64::new(1),
            outbound,
        })
    }

    /// This node's identity.
    #[must_use]
    pub fn node_id(&self) -> &NodeId {
        &self.config.node_id
    }

    /// The configured query deadline.
    #[must_use]
    pub fn query_timeout(&self) -> Duration {
        self.config.query_timeout
    }

    /// Name of the underlying transport.
    #[must_use]
    pub fn transport_name(&self) -> &'static str {
        self.transport.name()
    }

    /// Check if the underlying transport is healthy.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.transport.is_healthy()
    }

    /// Number of queries still waiting for replies.
    #[must_use]
    pub fn pending_queries(&self) -> usize {
        self.pending.len()
    }

    /// Build a topic for an app on this deployment.
    #[must_use]
    pub fn topic(&self, app_id: &str, purpose: &TopicPurpose) -> String {
        topic_for(&self.config.topic_prefix, app_id, purpose)
    }

    /// Route an app's events, queries, and this node's replies into `sink`.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport refuses a subscription.
    pub async fn subscribe_app(&self, app_id: &str, sink: EnvelopeSink) -> Result<(), TransportError> {
        let purposes = [
            TopicPurpose::Events,
            TopicPurpose::Queries,
            TopicPurpose::Replies(self.config.node_id.clone()),
        ];
        for purpose in &purposes {
            self.transport
                .subscribe(&self.topic(app_id, purpose), sink.clone())
                .await?;
        }
        debug!(app = %app_id, node = %self.config.node_id, "Subscribed to replication topics");
        Ok(())
    }

    fn enqueue(&self, topic: String, payload: Bytes) {
        match self.outbound.try_send((topic, payload)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full((topic, _))) => {
                warn!(topic = %topic, "Replication backlog full; dropping outbound message");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("Replication pump is gone; dropping outbound message");
            }
        }
    }

    /// Queue a local event for every other node.
    ///
    /// Never waits on the network.
    ///
    /// # Errors
    ///
    /// Returns an error if the event cannot be encoded.
    pub fn publish_event(&self, app_id: &str, message: &Message) -> Result<(), ProtocolError> {
        let replicated = ReplicationMessage::Event {
            origin: self.config.node_id.clone(),
            app_id: app_id.to_string(),
            channel: message.channel.clone(),
            event: message.event.clone(),
            payload: message.payload.to_vec(),
            source: message.source.as_ref().map(|s| s.as_str().to_string()),
        };
        let payload = codec::to_bytes(&replicated)?;
        self.enqueue(self.topic(app_id, &TopicPurpose::Events), payload);
        trace!(app = %app_id, channel = %message.channel, "Queued event for replication");
        Ok(())
    }

    /// Send this node's local counts back to the node that asked.
    ///
    /// # Errors
    ///
    /// Returns an error if the reply cannot be encoded.
    pub fn answer_query(
        &self,
        app_id: &str,
        asker: &NodeId,
        query_id: QueryId,
        counts: HashMap<String, u64>,
    ) -> Result<(), ProtocolError> {
        let reply = ReplicationMessage::MemberCountReply {
            origin: self.config.node_id.clone(),
            app_id: app_id.to_string(),
            query_id,
            counts,
        };
        let payload = codec::to_bytes(&reply)?;
        self.enqueue(
            self.topic(app_id, &TopicPurpose::Replies(asker.clone())),
            payload,
        );
        trace!(app = %app_id, asker = %asker, query_id, "Answered member count query");
        Ok(())
    }

    /// Ask every node for its member counts and merge the answers.
    ///
    /// `local` holds this node's count for every requested channel; its keys
    /// are the channels asked about. The result has exactly those keys.
    /// Waits at most the query deadline and never fails: if the transport is
    /// down the local answer comes back as is.
    pub async fn query_member_counts(
        &self,
        app_id: &str,
        local: HashMap<String, u64>,
    ) -> HashMap<String, u64> {
        let expected = self.peers.peer_count();
        if local.is_empty() || expected == Some(0) {
            return local;
        }

        let query_id = self.next_query.fetch_add(1, Ordering::Relaxed);
        let channels: Vec<String> = local.keys().cloned().collect();
        let query = ReplicationMessage::MemberCountQuery {
            origin: self.config.node_id.clone(),
            app_id: app_id.to_string(),
            query_id,
            channels,
        };
        let payload = match codec::to_bytes(&query) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(app = %app_id, error = %e, "Failed to encode member count query");
                return local;
            }
        };

        let (resolve, mut resolved) = oneshot::channel();
        let deadline = Instant::now() + self.config.query_timeout;
        self.pending.insert(
            query_id,
            PendingQuery {
                app_id: app_id.to_string(),
                deadline,
                responders: HashSet::new(),
                expected,
                counts: local.clone(),
                resolve,
            },
        );
        let _guard = PendingGuard {
            pending: &self.pending,
            query_id,
        };

        let topic = self.topic(app_id, &TopicPurpose::Queries);
        if let Err(e) = self.transport.publish(&topic, payload).await {
            warn!(app = %app_id, query_id, error = %e, "Member count query not sent; using local counts");
            return local;
        }
        trace!(app = %app_id, query_id, ?expected, "Sent member count query");

        match tokio::time::timeout_at(deadline, &mut resolved).await {
            Ok(Ok(counts)) => counts,
            _ => match self.pending.remove(&query_id) {
                Some((_, query)) => {
                    debug!(
                        app = %app_id,
                        query_id,
                        responders = query.responders.len(),
                        ?expected,
                        "Member count query timed out; using partial counts"
                    );
                    query.counts
                }
                // Resolved between the deadline firing and the removal.
                None => resolved.try_recv().unwrap_or(local),
            },
        }
    }

    /// Merge one node's reply into its pending query.
    ///
    /// Counts for channels that were not asked about are ignored. Returns
    /// `false` if the reply was dropped: unknown or expired query, wrong
    /// app, our own reply, or a second reply from the same node.
    pub fn accept_reply(
        &self,
        origin: &NodeId,
        app_id: &str,
        query_id: QueryId,
        counts: HashMap<String, u64>,
    ) -> bool {
        if origin == &self.config.node_id {
            return false;
        }

        let Some(mut query) = self.pending.get_mut(&query_id) else {
            trace!(query_id, origin = %origin, "Dropping reply for unknown query");
            return false;
        };
        if query.app_id != app_id || Instant::now() >= query.deadline {
            return false;
        }
        if !query.responders.insert(origin.clone()) {
            debug!(query_id, origin = %origin, "Dropping duplicate reply");
            return false;
        }

        for (channel, count) in counts {
            if let Some(total) = query.counts.get_mut(&channel) {
                *total += count;
            }
        }

        let complete = query
            .expected
            .is_some_and(|expected| query.responders.len() >= expected);
        drop(query);

        if complete {
            if let Some((_, query)) = self.pending.remove(&query_id) {
                trace!(query_id, responders = query.responders.len(), "Member count query complete");
                let _ = query.resolve.send(query.counts);
            }
        }
        true
    }
}

impl std::fmt::Debug for ReplicationCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationCoordinator")
            .field("config", &self.config)
            .field("transport", &self.transport.name())
            .field("pending", &self.pending.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tenvis_relay_transport::{Envelope, MemoryHub, StaticPeers};

    fn config(node: &str) -> CoordinatorConfig {
        CoordinatorConfig {
            node_id: NodeId::new(node),
            topic_prefix: "test".to_string(),
            query_timeout: Duration::from_millis(500),
        }
    }

    fn counts(pairs: &[(&str, u64)]) -> HashMap<String, u64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    /// Feed replies addressed to `coordinator` back into it.
    async fn listen(coordinator: &Arc<ReplicationCoordinator>, app_id: &str) {
        let (sink, mut inbox) = mpsc::unbounded_channel::<Envelope>();
        coordinator.subscribe_app(app_id, sink).await.unwrap();
        let coordinator = Arc::clone(coordinator);
        tokio::spawn(async move {
            while let Some(envelope) = inbox.recv().await {
                if let Ok(ReplicationMessage::MemberCountReply {
                    origin,
                    app_id,
                    query_id,
                    counts,
                }) = codec::from_slice::<ReplicationMessage>(&envelope.payload)
                {
                    coordinator.accept_reply(&origin, &app_id, query_id, counts);
                }
            }
        });
    }

    /// A peer answering every query on `app_id` with fixed counts, `times`
    /// times per query.
    async fn fake_peer(hub: &Arc<MemoryHub>, name: &str, app_id: &str, answer: HashMap<String, u64>, times: usize) {
        let transport = Arc::new(hub.transport());
        let (sink, mut inbox) = mpsc::unbounded_channel::<Envelope>();
        transport
            .subscribe(&topic_for("test", app_id, &TopicPurpose::Queries), sink)
            .await
            .unwrap();
        let origin = NodeId::new(name);
        tokio::spawn(async move {
            while let Some(envelope) = inbox.recv().await {
                let Ok(ReplicationMessage::MemberCountQuery {
                    origin: asker,
                    app_id,
                    query_id,
                    ..
                }) = codec::from_slice::<ReplicationMessage>(&envelope.payload)
                else {
                    continue;
                };
                let reply = ReplicationMessage::MemberCountReply {
                    origin: origin.clone(),
                    app_id: app_id.clone(),
                    query_id,
                    counts: answer.clone(),
                };
                let topic = topic_for("test", &app_id, &TopicPurpose::Replies(asker));
                for _ in 0..times {
                    let payload = codec::to_bytes(&reply).unwrap();
                    let _ = transport.publish(&topic, payload).await;
                }
            }
        });
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_replies_resolve_at_deadline() {
        let hub = MemoryHub::new();
        let coordinator =
            ReplicationCoordinator::start(config("n0"), Arc::new(hub.transport()), Arc::new(StaticPeers::exactly(3)));
        listen(&coordinator, "A").await;
        fake_peer(&hub, "n1", "A", counts(&[("presence-x", 2)]), 1).await;
        fake_peer(&hub, "n2", "A", counts(&[("presence-x", 3)]), 1).await;

        let started = Instant::now();
        let merged = coordinator
            .query_member_counts("A", counts(&[("presence-x", 1)]))
            .await;

        assert_eq!(merged, counts(&[("presence-x", 6)]));
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(500));
        assert!(elapsed < Duration::from_millis(600));
        assert_eq!(coordinator.pending_queries(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_replies_resolve_early() {
        let hub = MemoryHub::new();
        let coordinator =
            ReplicationCoordinator::start(config("n0"), Arc::new(hub.transport()), Arc::new(StaticPeers::exactly(2)));
        listen(&coordinator, "A").await;
        fake_peer(&hub, "n1", "A", counts(&[("presence-x", 2), ("presence-y", 1)]), 1).await;
        fake_peer(&hub, "n2", "A", counts(&[("presence-x", 0), ("presence-y", 4)]), 1).await;

        let started = Instant::now();
        let merged = coordinator
            .query_member_counts("A", counts(&[("presence-x", 1), ("presence-y", 0)]))
            .await;

        assert_eq!(merged, counts(&[("presence-x", 3), ("presence-y", 5)]));
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_and_unrequested_counts_are_ignored() {
        let hub = MemoryHub::new();
        let coordinator =
            ReplicationCoordinator::start(config("n0"), Arc::new(hub.transport()), Arc::new(StaticPeers::unknown()));
        listen(&coordinator, "A").await;
        fake_peer(&hub, "n1", "A", counts(&[("presence-x", 2), ("presence-other", 9)]), 2).await;

        let merged = coordinator
            .query_member_counts("A", counts(&[("presence-x", 1)]))
            .await;

        assert_eq!(merged, counts(&[("presence-x", 3)]));
    }

    #[tokio::test]
    async fn test_unknown_and_late_replies_are_dropped() {
        let hub = MemoryHub::new();
        let coordinator =
            ReplicationCoordinator::start(config("n0"), Arc::new(hub.transport()), Arc::new(StaticPeers::exactly(1)));
        listen(&coordinator, "A").await;
        fake_peer(&hub, "n1", "A", counts(&[("presence-x", 1)]), 1).await;

        assert!(!coordinator.accept_reply(&NodeId::new("n1"), "A", 999, counts(&[("presence-x", 5)])));

        let merged = coordinator
            .query_member_counts("A", counts(&[("presence-x", 1)]))
            .await;
        assert_eq!(merged, counts(&[("presence-x", 2)]));

        // Query ids start at 1; the first query is resolved and gone.
        assert!(!coordinator.accept_reply(&NodeId::new("n2"), "A", 1, counts(&[("presence-x", 5)])));
        assert_eq!(coordinator.pending_queries(), 0);
    }

    #[tokio::test]
    async fn test_unavailable_transport_returns_local_counts() {
        let hub = MemoryHub::new();
        let transport = Arc::new(hub.transport());
        let coordinator = ReplicationCoordinator::start(
            config("n0"),
            Arc::clone(&transport) as Arc<dyn ReplicationTransport>,
            Arc::new(StaticPeers::exactly(2)),
        );
        transport.set_available(false);

        let merged = coordinator
            .query_member_counts("A", counts(&[("presence-x", 4)]))
            .await;
        assert_eq!(merged, counts(&[("presence-x", 4)]));
        assert_eq!(coordinator.pending_queries(), 0);
    }

    #[tokio::test]
    async fn test_no_peers_skips_the_network() {
        let hub = MemoryHub::new();
        let observer = hub.transport();
        let (sink, mut inbox) = mpsc::unbounded_channel();
        observer
            .subscribe(&topic_for("test", "A", &TopicPurpose::Queries), sink)
            .await
            .unwrap();
        let coordinator =
            ReplicationCoordinator::start(config("n0"), Arc::new(hub.transport()), Arc::new(StaticPeers::exactly(0)));

        let merged = coordinator
            .query_member_counts("A", counts(&[("presence-x", 4)]))
            .await;
        assert_eq!(merged, counts(&[("presence-x", 4)]));
        assert!(inbox.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_full_backlog_drops_instead_of_blocking() {
        let hub = MemoryHub::new();
        let observer = hub.transport();
        let (sink, mut inbox) = mpsc::unbounded_channel();
        observer
            .subscribe(&topic_for("test", "A", &TopicPurpose::Events), sink)
            .await
            .unwrap();
        let coordinator =
            ReplicationCoordinator::start(config("n0"), Arc::new(hub.transport()), Arc::new(StaticPeers::unknown()));

        // The current-thread runtime cannot run the pump until this loop
        // yields, so everything past the queue size is dropped.
        let message = Message::new("chat", vec![1]);
        for _ in 0..OUTBOUND_QUEUE + 10 {
            coordinator.publish_event("A", &message).unwrap();
        }

        for _ in 0..OUTBOUND_QUEUE {
            inbox.recv().await.unwrap();
        }
        tokio::task::yield_now().await;
        assert!(inbox.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_events_keep_publish_order() {
        let hub = MemoryHub::new();
        let observer = hub.transport();
        let (sink, mut inbox) = mpsc::unbounded_channel();
        observer
            .subscribe(&topic_for("test", "A", &TopicPurpose::Events), sink)
            .await
            .unwrap();
        let coordinator =
            ReplicationCoordinator::start(config("n0"), Arc::new(hub.transport()), Arc::new(StaticPeers::unknown()));

        for i in 0..5u8 {
            let message = Message::new("chat", vec![i]).with_source("c1");
            coordinator.publish_event("A", &message).unwrap();
        }

        for i in 0..5u8 {
            let envelope = inbox.recv().await.unwrap();
            let ReplicationMessage::Event { origin, payload, source, .. } =
                codec::from_slice::<ReplicationMessage>(&envelope.payload).unwrap()
            else {
                panic!("expected an event");
            };
            assert_eq!(origin, NodeId::new("n0"));
            assert_eq!(payload, vec![i]);
            assert_eq!(source.as_deref(), Some("c1"));
        }
    }
}
