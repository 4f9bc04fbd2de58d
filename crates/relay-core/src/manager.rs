//! Channel manager for Relay.
//!
//! The manager owns every channel of the local process, keyed by app, and is
//! the entry point for the connection lifecycle. When a
//! [`ReplicationCoordinator`] is attached it also fans local events out to
//! the cluster and answers the cluster's questions about local state.

use crate::channel::{Channel, ChannelKind, ChannelNameError};
use crate::connection::{ConnectionHandle, ConnectionId};
use crate::coordinator::ReplicationCoordinator;
use crate::message::Message;
use crate::presence::{PresenceChannel, PresenceMember};
use dashmap::DashMap;
use relay_protocol::{codec, PresenceData, ReplicationMessage};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tenvis_relay_transport::{Envelope, TransportError};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// A tenant identifier.
pub type AppId = String;

/// Manager errors.
#[derive(Debug, Error)]
pub enum ManagerError {
    /// The channel name is invalid or of an unsupported kind.
    #[error(transparent)]
    ChannelName(#[from] ChannelNameError),

    /// Presence channels need a user identity.
    #[error("Presence channel {0} requires user data")]
    PresenceDataRequired(String),

    /// Not subscribed to channel.
    #[error("Not subscribed to channel: {0}")]
    NotSubscribed(String),

    /// Maximum subscriptions reached.
    #[error("Maximum subscriptions reached")]
    MaxSubscriptionsReached,
}

/// Manager configuration.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Maximum subscriptions per connection.
    pub max_subscriptions_per_connection: usize,
    /// Whether to delete channels as soon as their last subscriber leaves.
    pub auto_delete_empty_channels: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_subscriptions_per_connection: 100,
            auto_delete_empty_channels: true,
        }
    }
}

/// A snapshot of one local channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelInfo {
    /// Channel kind.
    pub kind: ChannelKind,
    /// Local subscribed connections.
    pub subscription_count: usize,
    /// Distinct local users, for presence channels.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_count: Option<usize>,
}

impl ChannelInfo {
    /// Check if anyone is subscribed locally.
    #[must_use]
    pub fn occupied(&self) -> bool {
        self.subscription_count > 0
    }
}

/// What a successful subscribe did.
#[derive(Debug, Clone)]
pub struct SubscribeOutcome {
    /// Channel kind.
    pub kind: ChannelKind,
    /// The connection is the channel's first local subscriber.
    pub first_subscriber: bool,
    /// The user became present on this node.
    pub member_added: bool,
    /// Local members, for presence channels.
    pub members: Option<serde_json::Value>,
}

/// A channel of one of the supported kinds.
#[derive(Debug)]
pub enum ChannelEntry {
    Public(Channel),
    Private(Channel),
    Presence(PresenceChannel),
}

impl ChannelEntry {
    fn new(kind: ChannelKind, name: &str) -> Self {
        match kind {
            ChannelKind::Public => ChannelEntry::Public(Channel::new(name)),
            ChannelKind::Private => ChannelEntry::Private(Channel::new(name)),
            ChannelKind::Presence => ChannelEntry::Presence(PresenceChannel::new(name)),
        }
    }

    /// Get the channel kind.
    #[must_use]
    pub fn kind(&self) -> ChannelKind {
        match self {
            ChannelEntry::Public(_) => ChannelKind::Public,
            ChannelEntry::Private(_) => ChannelKind::Private,
            ChannelEntry::Presence(_) => ChannelKind::Presence,
        }
    }

    /// The subscriber set.
    #[must_use]
    pub fn channel(&self) -> &Channel {
        match self {
            ChannelEntry::Public(c) | ChannelEntry::Private(c) => c,
            ChannelEntry::Presence(p) => p.channel(),
        }
    }

    /// Distinct local users, for presence channels.
    #[must_use]
    pub fn user_count(&self) -> Option<usize> {
        match self {
            ChannelEntry::Presence(p) => Some(p.user_count()),
            _ => None,
        }
    }

    /// Snapshot this channel.
    #[must_use]
    pub fn info(&self) -> ChannelInfo {
        ChannelInfo {
            kind: self.kind(),
            subscription_count: self.channel().subscriber_count(),
            user_count: self.user_count(),
        }
    }

    /// Check if the channel has no local subscribers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.channel().is_empty()
    }
}

struct ConnectionState {
    handle: ConnectionHandle,
    channels: HashSet<String>,
}

/// Channels and connections of one app.
#[derive(Default)]
pub struct AppChannels {
    channels: DashMap<String, ChannelEntry>,
    connections: DashMap<ConnectionId, ConnectionState>,
}

impl AppChannels {
    /// Number of channels.
    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Number of connected connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}

/// Manager statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ManagerStats {
    /// Apps with local state.
    pub app_count: usize,
    /// Local channels.
    pub channel_count: usize,
    /// Local connections.
    pub connection_count: usize,
    /// Total number of subscriptions.
    pub subscription_count: usize,
    /// Events published by local connections or the server.
    pub messages_published: u64,
    /// Messages queued to local connections.
    pub messages_delivered: u64,
}

/// Owner of all local channel state.
///
/// Every operation touches only local state and never blocks; cluster
/// member counts are the one exception and are async.
pub struct ChannelManager {
    apps: DashMap<AppId, Arc<AppChannels>>,
    config: ManagerConfig,
    coordinator: Option<Arc<ReplicationCoordinator>>,
    messages_published: AtomicU64,
    messages_delivered: AtomicU64,
}

impl ChannelManager {
    /// Create a manager without replication.
    #[must_use]
    pub fn new(config: ManagerConfig) -> Self {
        info!("Creating channel manager with config: {:?}", config);
        Self {
            apps: DashMap::new(),
            config,
            coordinator: None,
            messages_published: AtomicU64::new(0),
            messages_delivered: AtomicU64::new(0),
        }
    }

    /// Create a manager that replicates through `coordinator`.
    #[must_use]
    pub fn with_replication(config: ManagerConfig, coordinator: Arc<ReplicationCoordinator>) -> Self {
        let mut manager = Self::new(config);
        info!(node = %coordinator.node_id(), "Replication enabled");
        manager.coordinator = Some(coordinator);
        manager
    }

    /// The attached coordinator, if replication is enabled.
    #[must_use]
    pub fn coordinator(&self) -> Option<&Arc<ReplicationCoordinator>> {
        self.coordinator.as_ref()
    }

    /// Get the manager configuration.
    #[must_use]
    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    fn app(&self, app_id: &str) -> Arc<AppChannels> {
        if let Some(app) = self.apps.get(app_id) {
            return Arc::clone(&app);
        }
        Arc::clone(&self.apps.entry(app_id.to_string()).or_default())
    }

    fn existing_app(&self, app_id: &str) -> Option<Arc<AppChannels>> {
        self.apps.get(app_id).map(|app| Arc::clone(&app))
    }

    /// Register a freshly accepted connection.
    pub fn connect(&self, app_id: &str, handle: ConnectionHandle) {
        let app = self.app(app_id);
        debug!(app = %app_id, connection = %handle.id(), "Connection registered");
        app.connections.insert(
            handle.id().clone(),
            ConnectionState {
                handle,
                channels: HashSet::new(),
            },
        );
    }

    /// Forget a connection, leaving every channel it was subscribed to.
    ///
    /// Presence members held only by this connection are removed and the
    /// removal is announced locally and to the cluster. Returns the number
    /// of channels left.
    pub fn disconnect(&self, app_id: &str, connection_id: &ConnectionId) -> usize {
        let Some(app) = self.existing_app(app_id) else {
            return 0;
        };
        let Some((_, state)) = app.connections.remove(connection_id) else {
            return 0;
        };

        for channel in &state.channels {
            self.leave_channel(&app, app_id, connection_id, channel);
        }
        debug!(app = %app_id, connection = %connection_id, channels = state.channels.len(), "Connection disconnected");
        state.channels.len()
    }

    /// Subscribe a connection to a channel, creating the channel if needed.
    ///
    /// Presence channels need `presence` data; the joining user is announced
    /// to the channel's other local subscribers and to the cluster when it
    /// becomes present on this node.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel name is invalid, presence data is
    /// missing, or the connection hit its subscription limit. Nothing
    /// changes on error.
    pub fn subscribe(
        &self,
        app_id: &str,
        handle: &ConnectionHandle,
        channel_name: &str,
        presence: Option<PresenceData>,
    ) -> Result<SubscribeOutcome, ManagerError> {
        let kind = ChannelKind::parse(channel_name)?;
        if kind == ChannelKind::Presence && presence.is_none() {
            return Err(ManagerError::PresenceDataRequired(channel_name.to_string()));
        }

        let app = self.app(app_id);
        {
            let mut state = app
                .connections
                .entry(handle.id().clone())
                .or_insert_with(|| ConnectionState {
                    handle: handle.clone(),
                    channels: HashSet::new(),
                });
            if !state.channels.contains(channel_name)
                && state.channels.len() >= self.config.max_subscriptions_per_connection
            {
                return Err(ManagerError::MaxSubscriptionsReached);
            }
            state.channels.insert(channel_name.to_string());
        }

        let mut entry = app
            .channels
            .entry(channel_name.to_string())
            .or_insert_with(|| {
                debug!(app = %app_id, channel = %channel_name, kind = %kind, "Creating new channel");
                ChannelEntry::new(kind, channel_name)
            });

        let mut outcome = SubscribeOutcome {
            kind,
            first_subscriber: false,
            member_added: false,
            members: None,
        };
        let mut announce = None;
        match &mut *entry {
            ChannelEntry::Public(channel) | ChannelEntry::Private(channel) => {
                outcome.first_subscriber = channel.subscribe(handle);
            }
            ChannelEntry::Presence(channel) => {
                if let Some(data) = presence {
                    let joined = channel.join(handle, &data.user_id, data.user_info);
                    outcome.first_subscriber = joined.first_subscriber;
                    if let Some(member) = joined.added {
                        outcome.member_added = true;
                        announce = Some(Message::member_added(channel_name, &member).with_source(handle.id().clone()));
                    }
                }
                outcome.members = Some(channel.snapshot());
            }
        }
        debug!(
            app = %app_id,
            channel = %channel_name,
            connection = %handle.id(),
            subscribers = entry.channel().subscriber_count(),
            "Subscribed"
        );
        drop(entry);

        if let Some(message) = announce {
            self.replicate(app_id, &message);
        }
        Ok(outcome)
    }

    /// Unsubscribe a connection from a channel.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is not subscribed.
    pub fn unsubscribe(
        &self,
        app_id: &str,
        connection_id: &ConnectionId,
        channel_name: &str,
    ) -> Result<(), ManagerError> {
        let not_subscribed = || ManagerError::NotSubscribed(channel_name.to_string());
        let app = self.existing_app(app_id).ok_or_else(not_subscribed)?;
        let removed = app
            .connections
            .get_mut(connection_id)
            .map(|mut state| state.channels.remove(channel_name))
            .unwrap_or(false);
        if !removed {
            return Err(not_subscribed());
        }

        self.leave_channel(&app, app_id, connection_id, channel_name);
        Ok(())
    }

    fn leave_channel(&self, app: &AppChannels, app_id: &str, connection_id: &ConnectionId, channel_name: &str) {
        let Some(mut entry) = app.channels.get_mut(channel_name) else {
            return;
        };

        let mut announce = None;
        let now_empty = match &mut *entry {
            ChannelEntry::Public(channel) | ChannelEntry::Private(channel) => channel.unsubscribe(connection_id),
            ChannelEntry::Presence(channel) => {
                let left = channel.unsubscribe(connection_id);
                if let Some(member) = left.removed {
                    announce = Some(Message::member_removed(channel_name, &member.user_id));
                }
                left.now_empty
            }
        };
        debug!(app = %app_id, channel = %channel_name, connection = %connection_id, "Unsubscribed");
        drop(entry);

        if let Some(message) = announce {
            self.replicate(app_id, &message);
        }
        if now_empty && self.config.auto_delete_empty_channels {
            self.remove_if_empty(app_id, channel_name);
        }
    }

    /// Deliver an event to local subscribers and then to the cluster.
    ///
    /// `except` is skipped locally and on every other node. Returns the
    /// number of local connections the event was queued for.
    pub fn publish(&self, app_id: &str, message: Message, except: Option<&ConnectionId>) -> usize {
        let mut message = message;
        if message.source.is_none() {
            message.source = except.cloned();
        }
        let message = Arc::new(message);
        self.messages_published.fetch_add(1, Ordering::Relaxed);

        let delivered = self.deliver_local(app_id, &message, except);
        self.replicate(app_id, &message);
        delivered
    }

    fn deliver_local(&self, app_id: &str, message: &Arc<Message>, except: Option<&ConnectionId>) -> usize {
        let Some(app) = self.existing_app(app_id) else {
            return 0;
        };
        let delivered = match app.channels.get(&message.channel) {
            Some(entry) => entry.channel().broadcast(message, except),
            None => {
                trace!(app = %app_id, channel = %message.channel, "No local subscribers");
                0
            }
        };
        self.messages_delivered
            .fetch_add(delivered as u64, Ordering::Relaxed);
        delivered
    }

    fn replicate(&self, app_id: &str, message: &Message) {
        if let Some(coordinator) = &self.coordinator {
            if let Err(e) = coordinator.publish_event(app_id, message) {
                warn!(app = %app_id, channel = %message.channel, error = %e, "Failed to replicate event");
            }
        }
    }

    /// Snapshot every local channel of an app.
    #[must_use]
    pub fn get_channels(&self, app_id: &str) -> BTreeMap<String, ChannelInfo> {
        self.existing_app(app_id)
            .map(|app| {
                app.channels
                    .iter()
                    .map(|entry| (entry.key().clone(), entry.info()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Get a channel, creating it empty if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel name is invalid or of an unsupported
    /// kind.
    pub fn find_or_create(&self, app_id: &str, channel_name: &str) -> Result<ChannelInfo, ManagerError> {
        let kind = ChannelKind::parse(channel_name)?;
        let app = self.app(app_id);
        let entry = app
            .channels
            .entry(channel_name.to_string())
            .or_insert_with(|| ChannelEntry::new(kind, channel_name));
        Ok(entry.info())
    }

    /// Remove a channel if it has no local subscribers.
    ///
    /// Returns `true` if a channel was removed.
    pub fn remove_if_empty(&self, app_id: &str, channel_name: &str) -> bool {
        let Some(app) = self.existing_app(app_id) else {
            return false;
        };
        let removed = app
            .channels
            .remove_if(channel_name, |_, entry| entry.is_empty())
            .is_some();
        if removed {
            debug!(app = %app_id, channel = %channel_name, "Deleted empty channel");
        }
        removed
    }

    /// Snapshot one local channel.
    #[must_use]
    pub fn channel_info(&self, app_id: &str, channel_name: &str) -> Option<ChannelInfo> {
        let app = self.existing_app(app_id)?;
        let entry = app.channels.get(channel_name)?;
        Some(entry.info())
    }

    /// Local members of a presence channel, ordered by user ID.
    #[must_use]
    pub fn members(&self, app_id: &str, channel_name: &str) -> Vec<PresenceMember> {
        let Some(app) = self.existing_app(app_id) else {
            return Vec::new();
        };
        let Some(entry) = app.channels.get(channel_name) else {
            return Vec::new();
        };
        let ChannelEntry::Presence(channel) = &*entry else {
            return Vec::new();
        };

        let mut members: Vec<PresenceMember> = channel.presence().members().into_iter().cloned().collect();
        members.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        members
    }

    /// Local user counts of every presence channel whose name starts with
    /// `prefix`.
    #[must_use]
    pub fn local_member_counts(&self, app_id: &str, prefix: Option<&str>) -> HashMap<String, u64> {
        let Some(app) = self.existing_app(app_id) else {
            return HashMap::new();
        };
        app.channels
            .iter()
            .filter(|entry| prefix.map_or(true, |p| entry.key().starts_with(p)))
            .filter_map(|entry| {
                entry
                    .user_count()
                    .map(|count| (entry.key().clone(), count as u64))
            })
            .collect()
    }

    /// Local user counts of the named channels; unknown channels count 0.
    #[must_use]
    pub fn counts_for(&self, app_id: &str, channels: &[String]) -> HashMap<String, u64> {
        let app = self.existing_app(app_id);
        channels
            .iter()
            .map(|name| {
                let count = app
                    .as_ref()
                    .and_then(|app| app.channels.get(name).and_then(|e| e.user_count()))
                    .unwrap_or(0);
                (name.clone(), count as u64)
            })
            .collect()
    }

    /// Cluster-wide user counts of the presence channels matching `prefix`.
    ///
    /// The channels are the ones known locally. Without replication this is
    /// the local answer; with it, every node's count is added in (a user on
    /// two nodes counts twice) within the query deadline.
    pub async fn member_counts(&self, app_id: &str, prefix: Option<&str>) -> BTreeMap<String, u64> {
        let local = self.local_member_counts(app_id, prefix);
        match &self.coordinator {
            Some(coordinator) => coordinator
                .query_member_counts(app_id, local)
                .await
                .into_iter()
                .collect(),
            None => local.into_iter().collect(),
        }
    }

    /// Get manager statistics.
    #[must_use]
    pub fn stats(&self) -> ManagerStats {
        let mut stats = ManagerStats {
            app_count: self.apps.len(),
            messages_published: self.messages_published.load(Ordering::Relaxed),
            messages_delivered: self.messages_delivered.load(Ordering::Relaxed),
            ..ManagerStats::default()
        };
        for app in self.apps.iter() {
            stats.channel_count += app.channel_count();
            stats.connection_count += app.connection_count();
            stats.subscription_count += app.connections.iter().map(|c| c.channels.len()).sum::<usize>();
        }
        stats
    }

    /// The channels a connection is subscribed to.
    #[must_use]
    pub fn connection_channels(&self, app_id: &str, connection_id: &ConnectionId) -> Vec<String> {
        self.existing_app(app_id)
            .and_then(|app| {
                app.connections
                    .get(connection_id)
                    .map(|state| state.channels.iter().cloned().collect())
            })
            .unwrap_or_default()
    }

    /// Check if a connection is subscribed to a channel.
    #[must_use]
    pub fn is_subscribed(&self, app_id: &str, connection_id: &ConnectionId, channel_name: &str) -> bool {
        self.existing_app(app_id)
            .and_then(|app| {
                app.connections
                    .get(connection_id)
                    .map(|state| state.channels.contains(channel_name))
            })
            .unwrap_or(false)
    }

    /// Handle of a registered connection.
    #[must_use]
    pub fn connection(&self, app_id: &str, connection_id: &ConnectionId) -> Option<ConnectionHandle> {
        let app = self.existing_app(app_id)?;
        let state = app.connections.get(connection_id)?;
        Some(state.handle.clone())
    }

    /// Subscribe to the replication topics of `apps` and spawn the listener
    /// that applies inbound traffic.
    ///
    /// Returns `None` when replication is disabled.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport refuses a subscription.
    pub async fn start_replication(
        self: &Arc<Self>,
        apps: &[String],
    ) -> Result<Option<JoinHandle<()>>, TransportError> {
        let Some(coordinator) = &self.coordinator else {
            return Ok(None);
        };

        // Transports push into sinks from synchronous code, and this loop
        // never awaits between envelopes.
        let (sink, mut inbox) = mpsc::unbounded_channel::<Envelope>();
        for app_id in apps {
            coordinator.subscribe_app(app_id, sink.clone()).await?;
        }

        let manager: Weak<Self> = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            while let Some(envelope) = inbox.recv().await {
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                manager.handle_envelope(&envelope);
            }
            debug!("Replication listener stopped");
        });

        info!(apps = apps.len(), "Replication listener started");
        Ok(Some(handle))
    }

    /// Apply one message received from the replication transport.
    ///
    /// Undecodable payloads and this node's own messages are dropped.
    pub fn handle_envelope(&self, envelope: &Envelope) {
        let Some(coordinator) = &self.coordinator else {
            return;
        };
        let message = match codec::from_slice::<ReplicationMessage>(&envelope.payload) {
            Ok(message) => message,
            Err(e) => {
                warn!(topic = %envelope.topic, error = %e, "Dropping malformed replication message");
                return;
            }
        };
        if message.origin() == coordinator.node_id() {
            trace!(topic = %envelope.topic, "Skipping own replication message");
            return;
        }

        match message {
            ReplicationMessage::Event {
                app_id,
                channel,
                event,
                payload,
                source,
                ..
            } => {
                let mut local = Message::new(channel, payload);
                local.event = event;
                local.source = source.map(ConnectionId::from);
                let local = Arc::new(local);
                let except = local.source.clone();
                self.deliver_local(&app_id, &local, except.as_ref());
            }
            ReplicationMessage::MemberCountQuery {
                origin,
                app_id,
                query_id,
                channels,
            } => {
                let counts = self.counts_for(&app_id, &channels);
                if let Err(e) = coordinator.answer_query(&app_id, &origin, query_id, counts) {
                    warn!(app = %app_id, query_id, error = %e, "Failed to answer member count query");
                }
            }
            ReplicationMessage::MemberCountReply {
                origin,
                app_id,
                query_id,
                counts,
            } => {
                coordinator.accept_reply(&origin, &app_id, query_id, counts);
            }
        }
    }
}

impl Default for ChannelManager {
    fn default() -> Self {
        Self::new(ManagerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::CoordinatorConfig;
    use crate::message::{MEMBER_ADDED, MEMBER_REMOVED};
    use crate::topic::{topic_for, TopicPurpose};
    use bytes::Bytes;
    use relay_protocol::NodeId;
    use serde_json::json;
    use std::time::Duration;
    use tenvis_relay_transport::{
        HubHandle, HubServer, MemoryHub, ReplicationTransport, StaticPeers, WebSocketTransport,
    };

    fn presence(user_id: &str) -> Option<PresenceData> {
        Some(PresenceData {
            user_id: user_id.to_string(),
            user_info: None,
        })
    }

    fn events(rx: &mut mpsc::Receiver<Arc<Message>>) -> Vec<String> {
        let mut names = Vec::new();
        while let Ok(message) = rx.try_recv() {
            names.push(message.event.clone().unwrap_or_default());
        }
        names
    }

    async fn node(hub: &Arc<MemoryHub>, name: &str, peers: usize) -> Arc<ChannelManager> {
        node_on(Arc::new(hub.transport()), name, peers).await
    }

    async fn node_on(transport: Arc<dyn ReplicationTransport>, name: &str, peers: usize) -> Arc<ChannelManager> {
        let coordinator = ReplicationCoordinator::start(
            CoordinatorConfig {
                node_id: NodeId::new(name),
                topic_prefix: "test".to_string(),
                query_timeout: Duration::from_millis(500),
            },
            transport,
            Arc::new(StaticPeers::exactly(peers)),
        );
        let manager = Arc::new(ChannelManager::with_replication(ManagerConfig::default(), coordinator));
        manager
            .start_replication(&["A".to_string()])
            .await
            .unwrap()
            .expect("replication is enabled");
        manager
    }

    #[test]
    fn test_subscribe_unsubscribe() {
        let manager = ChannelManager::default();
        let (c1, _rx) = ConnectionHandle::channel("conn-1", 8);
        manager.connect("A", c1.clone());

        let outcome = manager.subscribe("A", &c1, "chat", None).unwrap();
        assert!(outcome.first_subscriber);
        assert_eq!(outcome.kind, ChannelKind::Public);
        assert_eq!(manager.channel_info("A", "chat").unwrap().subscription_count, 1);

        manager.unsubscribe("A", c1.id(), "chat").unwrap();
        // Channel should be auto-deleted
        assert!(manager.channel_info("A", "chat").is_none());
        assert!(matches!(
            manager.unsubscribe("A", c1.id(), "chat"),
            Err(ManagerError::NotSubscribed(_))
        ));
    }

    #[test]
    fn test_invalid_channels_change_nothing() {
        let manager = ChannelManager::default();
        let (c1, _rx) = ConnectionHandle::channel("conn-1", 8);

        assert!(matches!(
            manager.subscribe("A", &c1, "private-encrypted-x", None),
            Err(ManagerError::ChannelName(ChannelNameError::UnknownKind(_)))
        ));
        assert!(manager.subscribe("A", &c1, "$system", None).is_err());
        assert!(matches!(
            manager.subscribe("A", &c1, "presence-lobby", None),
            Err(ManagerError::PresenceDataRequired(_))
        ));
        assert!(manager.find_or_create("A", "private-encrypted-x").is_err());
        assert!(manager.get_channels("A").is_empty());
        assert!(manager.connection_channels("A", c1.id()).is_empty());
    }

    #[test]
    fn test_get_channels_snapshot() {
        let manager = ChannelManager::default();
        let (c1, _rx1) = ConnectionHandle::channel("conn-1", 8);
        let (c2, _rx2) = ConnectionHandle::channel("conn-2", 8);
        manager.subscribe("A", &c1, "chat", None).unwrap();
        manager.subscribe("A", &c2, "chat", None).unwrap();
        manager.subscribe("A", &c1, "presence-lobby", presence("u1")).unwrap();
        manager.subscribe("A", &c2, "presence-lobby", presence("u1")).unwrap();

        let channels = manager.get_channels("A");
        assert_eq!(channels.len(), 2);
        assert_eq!(channels["chat"].subscription_count, 2);
        assert_eq!(channels["chat"].user_count, None);
        assert_eq!(channels["presence-lobby"].subscription_count, 2);
        assert_eq!(channels["presence-lobby"].user_count, Some(1));
    }

    #[test]
    fn test_find_or_create_and_remove_if_empty() {
        let manager = ChannelManager::default();

        let info = manager.find_or_create("A", "private-orders").unwrap();
        assert_eq!(info.kind, ChannelKind::Private);
        assert!(!info.occupied());

        assert!(manager.remove_if_empty("A", "private-orders"));
        assert!(!manager.remove_if_empty("A", "private-orders"));
        assert!(!manager.remove_if_empty("missing-app", "private-orders"));
    }

    #[test]
    fn test_apps_are_isolated() {
        let manager = ChannelManager::default();
        let (a, mut rx_a) = ConnectionHandle::channel("conn-a", 8);
        let (b, mut rx_b) = ConnectionHandle::channel("conn-b", 8);
        manager.subscribe("A", &a, "chat", None).unwrap();
        manager.subscribe("B", &b, "chat", None).unwrap();

        let delivered = manager.publish("A", Message::new("chat", b"hi".to_vec()), None);
        assert_eq!(delivered, 1);
        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_err());
    }

    #[test]
    fn test_publish_skips_sender() {
        let manager = ChannelManager::default();
        let (a, mut rx_a) = ConnectionHandle::channel("conn-a", 8);
        let (b, mut rx_b) = ConnectionHandle::channel("conn-b", 8);
        manager.subscribe("A", &a, "chat", None).unwrap();
        manager.subscribe("A", &b, "chat", None).unwrap();

        let message = Message::new("chat", b"typing".to_vec()).with_event("client-typing");
        assert_eq!(manager.publish("A", message, Some(a.id())), 1);
        assert!(rx_a.try_recv().is_err());

        let received = rx_b.try_recv().unwrap();
        assert_eq!(received.source.as_ref(), Some(a.id()));
        assert_eq!(manager.stats().messages_delivered, 1);
    }

    #[test]
    fn test_disconnect_leaves_everything() {
        let manager = ChannelManager::default();
        let (watcher, mut watcher_rx) = ConnectionHandle::channel("watcher", 8);
        let (leaver, _leaver_rx) = ConnectionHandle::channel("leaver", 8);
        manager.connect("A", watcher.clone());
        manager.connect("A", leaver.clone());
        manager.subscribe("A", &watcher, "presence-lobby", presence("w")).unwrap();
        manager.subscribe("A", &leaver, "presence-lobby", presence("u1")).unwrap();
        manager.subscribe("A", &leaver, "chat", None).unwrap();
        assert_eq!(events(&mut watcher_rx), vec![MEMBER_ADDED]);

        assert_eq!(manager.disconnect("A", leaver.id()), 2);

        assert_eq!(events(&mut watcher_rx), vec![MEMBER_REMOVED]);
        assert!(manager.channel_info("A", "chat").is_none());
        assert_eq!(manager.channel_info("A", "presence-lobby").unwrap().user_count, Some(1));
        assert_eq!(manager.disconnect("A", leaver.id()), 0);
    }

    #[test]
    fn test_connection_keeps_first_identity() {
        let manager = ChannelManager::default();
        let (c1, _rx) = ConnectionHandle::channel("conn-1", 8);
        manager.subscribe("A", &c1, "presence-lobby", presence("u1")).unwrap();

        let again = manager.subscribe("A", &c1, "presence-lobby", presence("u2")).unwrap();
        assert!(!again.member_added);

        let members = manager.members("A", "presence-lobby");
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].user_id, "u1");
    }

    #[test]
    fn test_subscribe_returns_local_members() {
        let manager = ChannelManager::default();
        let (c1, _rx1) = ConnectionHandle::channel("conn-1", 8);
        let (c2, _rx2) = ConnectionHandle::channel("conn-2", 8);
        manager
            .subscribe(
                "A",
                &c1,
                "presence-lobby",
                Some(PresenceData {
                    user_id: "u1".to_string(),
                    user_info: Some(json!({"name": "Ann"})),
                }),
            )
            .unwrap();

        let outcome = manager.subscribe("A", &c2, "presence-lobby", presence("u2")).unwrap();
        assert!(outcome.member_added);
        let members = outcome.members.unwrap();
        assert_eq!(members["presence"]["count"], 2);
        assert_eq!(members["presence"]["hash"]["u1"]["name"], "Ann");
    }

    #[test]
    fn test_empty_channel_retention() {
        let manager = ChannelManager::new(ManagerConfig {
            auto_delete_empty_channels: false,
            ..ManagerConfig::default()
        });
        let (c1, _rx) = ConnectionHandle::channel("conn-1", 8);
        manager.subscribe("A", &c1, "chat", None).unwrap();
        manager.unsubscribe("A", c1.id(), "chat").unwrap();

        assert!(!manager.get_channels("A")["chat"].occupied());
        assert!(manager.remove_if_empty("A", "chat"));
        assert!(manager.get_channels("A").is_empty());
    }

    #[test]
    fn test_max_subscriptions() {
        let manager = ChannelManager::new(ManagerConfig {
            max_subscriptions_per_connection: 2,
            ..ManagerConfig::default()
        });
        let (c1, _rx) = ConnectionHandle::channel("conn-1", 8);
        manager.subscribe("A", &c1, "one", None).unwrap();
        manager.subscribe("A", &c1, "two", None).unwrap();
        // Re-subscribing does not count against the limit.
        manager.subscribe("A", &c1, "two", None).unwrap();

        assert!(matches!(
            manager.subscribe("A", &c1, "three", None),
            Err(ManagerError::MaxSubscriptionsReached)
        ));
        assert!(manager.channel_info("A", "three").is_none());
    }

    #[test]
    fn test_stats() {
        let manager = ChannelManager::default();
        let (c1, _rx1) = ConnectionHandle::channel("conn-1", 8);
        let (c2, _rx2) = ConnectionHandle::channel("conn-2", 8);
        manager.subscribe("A", &c1, "channel-1", None).unwrap();
        manager.subscribe("A", &c1, "channel-2", None).unwrap();
        manager.subscribe("B", &c2, "channel-1", None).unwrap();

        let stats = manager.stats();
        assert_eq!(stats.app_count, 2);
        assert_eq!(stats.channel_count, 3);
        assert_eq!(stats.connection_count, 2);
        assert_eq!(stats.subscription_count, 3);
    }

    #[tokio::test]
    async fn test_member_counts_without_replication_are_local() {
        let manager = ChannelManager::default();
        let (c1, _rx1) = ConnectionHandle::channel("conn-1", 8);
        let (c2, _rx2) = ConnectionHandle::channel("conn-2", 8);
        manager.subscribe("A", &c1, "presence-a", presence("u1")).unwrap();
        manager.subscribe("A", &c2, "presence-a", presence("u2")).unwrap();
        manager.subscribe("A", &c1, "other-presence-b", presence("u1")).unwrap();
        manager.subscribe("A", &c1, "chat", None).unwrap();

        let filtered = manager.member_counts("A", Some("presence-")).await;
        assert_eq!(filtered, BTreeMap::from([("presence-a".to_string(), 2)]));

        let all = manager.member_counts("A", None).await;
        let local: BTreeMap<_, _> = manager.local_member_counts("A", None).into_iter().collect();
        assert_eq!(all, local);
        assert_eq!(all.len(), 2);

        assert!(manager.member_counts("A", Some("nothing-")).await.is_empty());
    }

    #[tokio::test]
    async fn test_cluster_member_counts_add_across_nodes() {
        let hub = MemoryHub::new();
        let node_a = node(&hub, "node-a", 1).await;
        let node_b = node(&hub, "node-b", 1).await;

        let (a1, _ra1) = ConnectionHandle::channel("a1", 8);
        let (a2, _ra2) = ConnectionHandle::channel("a2", 8);
        let (b1, _rb1) = ConnectionHandle::channel("b1", 8);
        let (b2, _rb2) = ConnectionHandle::channel("b2", 8);
        node_a.subscribe("A", &a1, "presence-room", presence("u1")).unwrap();
        node_a.subscribe("A", &a2, "presence-room", presence("u2")).unwrap();
        node_b.subscribe("A", &b1, "presence-room", presence("u2")).unwrap();
        node_b.subscribe("A", &b2, "presence-room", presence("u3")).unwrap();

        let counts = node_a.member_counts("A", Some("presence-")).await;
        assert_eq!(counts, BTreeMap::from([("presence-room".to_string(), 4)]));
        assert_eq!(node_a.coordinator().unwrap().pending_queries(), 0);
    }

    async fn wait_for_subscribers(hub: &HubHandle, topic: &str, expected: usize) {
        for _ in 0..200 {
            if hub.subscriber_count(topic) == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("hub never saw {} subscribers on {}", expected, topic);
    }

    #[tokio::test]
    async fn test_cluster_member_counts_over_websocket_hub() {
        let server = HubServer::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let url = format!("ws://{}", server.local_addr().unwrap());
        let hub = server.handle();
        tokio::spawn(server.run());

        let link_a = WebSocketTransport::connect(&url).await.unwrap();
        let link_b = WebSocketTransport::connect(&url).await.unwrap();
        let node_a = node_on(Arc::new(link_a), "node-a", 1).await;
        let node_b = node_on(Arc::new(link_b), "node-b", 1).await;
        wait_for_subscribers(&hub, &topic_for("test", "A", &TopicPurpose::Queries), 2).await;
        wait_for_subscribers(
            &hub,
            &topic_for("test", "A", &TopicPurpose::Replies(NodeId::new("node-a"))),
            1,
        )
        .await;

        let (a1, _ra1) = ConnectionHandle::channel("a1", 8);
        let (a2, _ra2) = ConnectionHandle::channel("a2", 8);
        let (b1, _rb1) = ConnectionHandle::channel("b1", 8);
        let (b2, _rb2) = ConnectionHandle::channel("b2", 8);
        node_a.subscribe("A", &a1, "presence-room", presence("u1")).unwrap();
        node_a.subscribe("A", &a2, "presence-room", presence("u2")).unwrap();
        node_b.subscribe("A", &b1, "presence-room", presence("u2")).unwrap();
        node_b.subscribe("A", &b2, "presence-room", presence("u3")).unwrap();

        let counts = node_a.member_counts("A", Some("presence-")).await;
        assert_eq!(counts, BTreeMap::from([("presence-room".to_string(), 4)]));
        assert_eq!(node_a.coordinator().unwrap().pending_queries(), 0);
        assert_eq!(hub.link_count(), 2);
    }

    #[tokio::test]
    async fn test_garbage_reply_does_not_disturb_pending_query() {
        let hub = MemoryHub::new();
        let node_a = node(&hub, "node-a", 1).await;
        let (a1, _ra1) = ConnectionHandle::channel("a1", 8);
        node_a.subscribe("A", &a1, "presence-room", presence("u1")).unwrap();

        // A hand-driven peer that answers every query with undecodable bytes
        // first and a real reply second, both on node-a's replies topic.
        let peer = hub.transport();
        let (sink, mut queries) = mpsc::unbounded_channel();
        peer.subscribe(&topic_for("test", "A", &TopicPurpose::Queries), sink)
            .await
            .unwrap();
        let replies = topic_for("test", "A", &TopicPurpose::Replies(NodeId::new("node-a")));
        tokio::spawn(async move {
            while let Some(envelope) = queries.recv().await {
                let Ok(ReplicationMessage::MemberCountQuery {
                    app_id,
                    query_id,
                    channels,
                    ..
                }) = codec::from_slice::<ReplicationMessage>(&envelope.payload)
                else {
                    continue;
                };
                peer.publish(&replies, Bytes::from_static(b"\xc1 not a reply"))
                    .await
                    .unwrap();
                let reply = ReplicationMessage::MemberCountReply {
                    origin: NodeId::new("node-x"),
                    app_id,
                    query_id,
                    counts: channels.into_iter().map(|channel| (channel, 2)).collect(),
                };
                peer.publish(&replies, codec::to_bytes(&reply).unwrap())
                    .await
                    .unwrap();
            }
        });

        // Twice: the listener must still be running after the garbage.
        for _ in 0..2 {
            let started = tokio::time::Instant::now();
            let counts = node_a.member_counts("A", Some("presence-")).await;
            assert_eq!(counts, BTreeMap::from([("presence-room".to_string(), 3)]));
            assert!(started.elapsed() < Duration::from_millis(500));
        }
        assert_eq!(node_a.coordinator().unwrap().pending_queries(), 0);
    }

    #[tokio::test]
    async fn test_events_reach_other_nodes_once() {
        let hub = MemoryHub::new();
        let node_a = node(&hub, "node-a", 1).await;
        let node_b = node(&hub, "node-b", 1).await;

        let (local, mut local_rx) = ConnectionHandle::channel("local", 8);
        let (remote, mut remote_rx) = ConnectionHandle::channel("remote", 8);
        node_a.subscribe("A", &local, "chat", None).unwrap();
        node_b.subscribe("A", &remote, "chat", None).unwrap();

        let message = Message::new("chat", b"hello".to_vec()).with_event("greeting");
        assert_eq!(node_a.publish("A", message, None), 1);

        let received = tokio::time::timeout(Duration::from_secs(1), remote_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(received.is_event("greeting"));
        assert_eq!(&received.payload[..], b"hello");

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(events(&mut local_rx), vec!["greeting"]);
        assert!(remote_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_presence_events_are_forwarded_not_mirrored() {
        let hub = MemoryHub::new();
        let node_a = node(&hub, "node-a", 1).await;
        let node_b = node(&hub, "node-b", 1).await;

        let (watcher, mut watcher_rx) = ConnectionHandle::channel("watcher", 8);
        node_a.subscribe("A", &watcher, "presence-room", presence("w")).unwrap();

        let (joiner, _joiner_rx) = ConnectionHandle::channel("joiner", 8);
        node_b.subscribe("A", &joiner, "presence-room", presence("u9")).unwrap();

        let added = tokio::time::timeout(Duration::from_secs(1), watcher_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(added.is_event(MEMBER_ADDED));
        // Node A only forwards; its roster still holds just its own user.
        assert_eq!(node_a.members("A", "presence-room").len(), 1);

        node_b.disconnect("A", joiner.id());
        let removed = tokio::time::timeout(Duration::from_secs(1), watcher_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(removed.is_event(MEMBER_REMOVED));
    }

    #[tokio::test]
    async fn test_malformed_replication_message_is_dropped() {
        let hub = MemoryHub::new();
        let node_a = node(&hub, "node-a", 1).await;
        let node_b = node(&hub, "node-b", 1).await;
        let (remote, mut remote_rx) = ConnectionHandle::channel("remote", 8);
        node_b.subscribe("A", &remote, "chat", None).unwrap();

        node_b.handle_envelope(&Envelope {
            topic: topic_for("test", "A", &TopicPurpose::Events),
            payload: Bytes::from_static(b"\xc1 not msgpack"),
        });

        // The listener keeps working afterwards.
        node_a.publish("A", Message::new("chat", b"after".to_vec()), None);
        let received = tokio::time::timeout(Duration::from_secs(1), remote_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&received.payload[..], b"after");
    }

    #[tokio::test]
    async fn test_replication_disabled_has_no_listener() {
        let manager = Arc::new(ChannelManager::default());
        assert!(manager.start_replication(&["A".to_string()]).await.unwrap().is_none());
        assert!(manager.coordinator().is_none());
    }
}
