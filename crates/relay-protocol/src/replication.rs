//! Messages exchanged between Relay nodes over the replication transport.
//!
//! Every message names the node that produced it, so a node can recognise
//! and skip its own traffic when the transport loops it back.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Correlation id of an in-flight cluster query, unique per issuing node.
pub type QueryId = u64;

/// Identifier of one server process in the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl NodeId {
    /// Create a node ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a node ID from the process id and the current time.
    #[must_use]
    pub fn generate() -> Self {
        use std::time::{SystemTime, UNIX_EPOCH};
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        Self(format!("node_{:x}_{:x}", std::process::id(), timestamp))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A replication message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReplicationMessage {
    /// An event broadcast on a channel by `origin`.
    Event {
        origin: NodeId,
        app_id: String,
        channel: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        event: Option<String>,
        #[serde(with = "serde_bytes")]
        payload: Vec<u8>,
        /// Connection that produced the event, excluded from delivery.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source: Option<String>,
    },

    /// Ask every node for its local member counts.
    MemberCountQuery {
        origin: NodeId,
        app_id: String,
        query_id: QueryId,
        channels: Vec<String>,
    },

    /// One node's answer to a [`ReplicationMessage::MemberCountQuery`].
    MemberCountReply {
        origin: NodeId,
        app_id: String,
        query_id: QueryId,
        counts: HashMap<String, u64>,
    },
}

impl ReplicationMessage {
    /// The node that produced this message.
    #[must_use]
    pub fn origin(&self) -> &NodeId {
        match self {
            ReplicationMessage::Event { origin, .. }
            | ReplicationMessage::MemberCountQuery { origin, .. }
            | ReplicationMessage::MemberCountReply { origin, .. } => origin,
        }
    }

    /// The app this message is scoped to.
    #[must_use]
    pub fn app_id(&self) -> &str {
        match self {
            ReplicationMessage::Event { app_id, .. }
            | ReplicationMessage::MemberCountQuery { app_id, .. }
            | ReplicationMessage::MemberCountReply { app_id, .. } => app_id,
        }
    }
}
