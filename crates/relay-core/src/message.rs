//! Events delivered to connections.
//!
//! An event is a tagged payload addressed to a channel. Presence
//! notifications are ordinary events with reserved names and JSON payloads.

use crate::connection::ConnectionId;
use crate::presence::PresenceMember;
use bytes::Bytes;
use serde_json::json;

/// Event sent to a presence channel when a user's first connection joins.
pub const MEMBER_ADDED: &str = "member_added";

/// Event sent to a presence channel when a user's last connection leaves.
pub const MEMBER_REMOVED: &str = "member_removed";

/// Event sent to a connection once its subscription is in place.
pub const SUBSCRIPTION_SUCCEEDED: &str = "subscription_succeeded";

/// An event addressed to one channel.
#[derive(Debug, Clone)]
pub struct Message {
    /// Connection that produced the event, if any.
    pub source: Option<ConnectionId>,
    /// Target channel.
    pub channel: String,
    /// Optional event name.
    pub event: Option<String>,
    /// Event payload.
    pub payload: Bytes,
}

impl Message {
    /// Create a new message.
    #[must_use]
    pub fn new(channel: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            source: None,
            channel: channel.into(),
            event: None,
            payload: payload.into(),
        }
    }

    /// Create a message with a source connection.
    #[must_use]
    pub fn with_source(mut self, source: impl Into<ConnectionId>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Create a message with an event name.
    #[must_use]
    pub fn with_event(mut self, event: impl Into<String>) -> Self {
        self.event = Some(event.into());
        self
    }

    /// The `member_added` notification for a presence member.
    #[must_use]
    pub fn member_added(channel: impl Into<String>, member: &PresenceMember) -> Self {
        let payload = json!({
            "user_id": member.user_id,
            "user_info": member.user_info,
        });
        Self::new(channel, payload.to_string()).with_event(MEMBER_ADDED)
    }

    /// The `member_removed` notification for a presence member.
    #[must_use]
    pub fn member_removed(channel: impl Into<String>, user_id: &str) -> Self {
        let payload = json!({ "user_id": user_id });
        Self::new(channel, payload.to_string()).with_event(MEMBER_REMOVED)
    }

    /// Check if this message carries the given event name.
    #[must_use]
    pub fn is_event(&self, name: &str) -> bool {
        self.event.as_deref() == Some(name)
    }
}
