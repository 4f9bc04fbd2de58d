//! Presence tracking for Relay.
//!
//! A presence channel knows which logical users are behind its local
//! connections. A user may hold several connections; the channel only
//! announces the user when the first one joins and when the last one leaves.

use crate::channel::Channel;
use crate::connection::{ConnectionHandle, ConnectionId};
use crate::message::Message;
use serde::Serialize;
use serde_json::json;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

/// One user present on a channel through at least one local connection.
#[derive(Debug, Clone, Serialize)]
pub struct PresenceMember {
    /// Logical user identifier.
    pub user_id: String,
    /// User-defined metadata.
    pub user_info: Option<serde_json::Value>,
    /// When the user's first local connection joined.
    pub joined_at: u64,
    /// Local connections asserting this identity.
    #[serde(skip)]
    connections: HashSet<ConnectionId>,
}

impl PresenceMember {
    pub(crate) fn new(user_id: impl Into<String>, user_info: Option<serde_json::Value>) -> Self {
        Self {
            user_id: user_id.into(),
            user_info,
            joined_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
            connections: HashSet::new(),
        }
    }

    /// Number of local connections asserting this identity.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}

/// Member roster of one presence channel.
#[derive(Debug, Default)]
pub struct Presence {
    /// Members by user ID.
    members: HashMap<String, PresenceMember>,
    /// The identity each connection asserted.
    by_connection: HashMap<ConnectionId, String>,
}

impl Presence {
    /// Create an empty roster.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the number of present users.
    #[must_use]
    pub fn user_count(&self) -> usize {
        self.members.len()
    }

    /// Check if a user is present.
    #[must_use]
    pub fn is_present(&self, user_id: &str) -> bool {
        self.members.contains_key(user_id)
    }

    /// Get a member by user ID.
    #[must_use]
    pub fn get(&self, user_id: &str) -> Option<&PresenceMember> {
        self.members.get(user_id)
    }

    /// Get the user a connection joined as.
    #[must_use]
    pub fn user_of(&self, connection_id: &ConnectionId) -> Option<&str> {
        self.by_connection.get(connection_id).map(String::as_str)
    }

    /// Record that a connection asserts `user_id`.
    ///
    /// A connection holds one identity per channel; joining again (under any
    /// user ID) is ignored. Returns `true` if the user was not present before.
    pub fn join(
        &mut self,
        connection_id: &ConnectionId,
        user_id: &str,
        user_info: Option<serde_json::Value>,
    ) -> bool {
        if let Some(existing) = self.by_connection.get(connection_id) {
            if existing != user_id {
                debug!(connection = %connection_id, user = %existing, "Connection already joined as another user");
            }
            return false;
        }

        self.by_connection
            .insert(connection_id.clone(), user_id.to_string());

        let member = self
            .members
            .entry(user_id.to_string())
            .or_insert_with(|| PresenceMember::new(user_id, user_info));
        member.connections.insert(connection_id.clone());

        let is_new = member.connections.len() == 1;
        if is_new {
            debug!(user = %user_id, connection = %connection_id, "Presence: member joined");
        }
        is_new
    }

    /// Drop one connection's claim on `user_id`.
    ///
    /// Returns the member if this was its last local connection. Leaving
    /// with a connection that does not hold that identity is a no-op.
    pub fn leave(&mut self, connection_id: &ConnectionId, user_id: &str) -> Option<PresenceMember> {
        if self.by_connection.get(connection_id).map(String::as_str) != Some(user_id) {
            return None;
        }
        self.by_connection.remove(connection_id);

        let member = self.members.get_mut(user_id)?;
        member.connections.remove(connection_id);
        if !member.connections.is_empty() {
            return None;
        }

        debug!(user = %user_id, "Presence: member left");
        self.members.remove(user_id)
    }

    /// Get all present members.
    #[must_use]
    pub fn members(&self) -> Vec<&PresenceMember> {
        self.members.values().collect()
    }

    /// Check if the roster is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Result of a connection joining a presence channel.
#[derive(Debug, Default)]
pub struct PresenceJoin {
    /// The connection is the channel's first local subscriber.
    pub first_subscriber: bool,
    /// Set when the user became present on this node.
    pub added: Option<PresenceMember>,
}

/// Result of a connection leaving a presence channel.
#[derive(Debug, Default)]
pub struct PresenceLeave {
    /// The channel has no local subscribers left.
    pub now_empty: bool,
    /// Set when the user is no longer present on this node.
    pub removed: Option<PresenceMember>,
}

/// A channel that also tracks member identities.
#[derive(Debug)]
pub struct PresenceChannel {
    channel: Channel,
    presence: Presence,
}

impl PresenceChannel {
    /// Create a new presence channel.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            channel: Channel::new(name),
            presence: Presence::new(),
        }
    }

    /// The underlying subscriber set.
    #[must_use]
    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Get the channel name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.channel.name()
    }

    /// Number of distinct users present on this node.
    #[must_use]
    pub fn user_count(&self) -> usize {
        self.presence.user_count()
    }

    /// The member roster.
    #[must_use]
    pub fn presence(&self) -> &Presence {
        &self.presence
    }

    /// Subscribe a connection and record its identity.
    ///
    /// When the user becomes present, `member_added` goes to every other
    /// local subscriber.
    pub fn join(
        &mut self,
        connection: &ConnectionHandle,
        user_id: &str,
        user_info: Option<serde_json::Value>,
    ) -> PresenceJoin {
        let first_subscriber = self.channel.subscribe(connection);
        if !self.presence.join(connection.id(), user_id, user_info) {
            return PresenceJoin {
                first_subscriber,
                added: None,
            };
        }

        let added = self.presence.get(user_id).cloned();
        if let Some(member) = &added {
            let message = Arc::new(Message::member_added(self.name(), member).with_source(connection.id().clone()));
            self.channel.broadcast(&message, Some(connection.id()));
        }
        PresenceJoin {
            first_subscriber,
            added,
        }
    }

    /// Drop one connection's claim on `user_id` without unsubscribing it.
    ///
    /// When the user is gone, `member_removed` goes to the remaining local
    /// subscribers.
    pub fn leave(&mut self, connection_id: &ConnectionId, user_id: &str) -> Option<PresenceMember> {
        let removed = self.presence.leave(connection_id, user_id)?;
        let message = Arc::new(Message::member_removed(self.name(), &removed.user_id));
        self.channel.broadcast(&message, Some(connection_id));
        Some(removed)
    }

    /// Unsubscribe a connection, leaving under whatever identity it held.
    pub fn unsubscribe(&mut self, connection_id: &ConnectionId) -> PresenceLeave {
        let removed = match self.presence.user_of(connection_id).map(str::to_string) {
            Some(user_id) => self.leave(connection_id, &user_id),
            None => None,
        };
        PresenceLeave {
            now_empty: self.channel.unsubscribe(connection_id),
            removed,
        }
    }

    /// The members payload sent with `subscription_succeeded`.
    ///
    /// Lists members present on this node only.
    #[must_use]
    pub fn snapshot(&self) -> serde_json::Value {
        let hash: BTreeMap<&str, &Option<serde_json::Value>> = self
            .presence
            .members
            .values()
            .map(|m| (m.user_id.as_str(), &m.user_info))
            .collect();
        let ids: Vec<&str> = hash.keys().copied().collect();

        json!({
            "presence": {
                "count": ids.len(),
                "ids": ids,
                "hash": hash,
            }
        })
    }
}
