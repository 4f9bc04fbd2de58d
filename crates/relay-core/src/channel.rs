//! Channel abstraction for Relay.
//!
//! Channels are named rooms, scoped to an app, where local connections
//! subscribe to receive events.

use crate::connection::{ConnectionHandle, ConnectionId, DeliveryError};
use crate::message::Message;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Maximum channel name length.
pub const MAX_CHANNEL_NAME_LENGTH: usize = 256;

/// Name prefix of private channels.
pub const PRIVATE_PREFIX: &str = "private-";

/// Name prefix of presence channels.
pub const PRESENCE_PREFIX: &str = "presence-";

/// Name prefix of end-to-end encrypted channels, which this server does not
/// implement.
pub const ENCRYPTED_PREFIX: &str = "private-encrypted-";

/// A channel identifier.
pub type ChannelId = String;

/// Channel name errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChannelNameError {
    /// The name is malformed.
    #[error("Invalid channel name: {0}")]
    Invalid(&'static str),

    /// The name selects a channel kind this server does not support.
    #[error("Unsupported channel kind for {0}")]
    UnknownKind(String),
}

/// Validate a channel name.
///
/// # Errors
///
/// Returns an error if the channel name is invalid.
pub fn validate_channel_name(name: &str) -> Result<(), ChannelNameError> {
    if name.is_empty() {
        return Err(ChannelNameError::Invalid("Channel name cannot be empty"));
    }
    if name.len() > MAX_CHANNEL_NAME_LENGTH {
        return Err(ChannelNameError::Invalid("Channel name too long"));
    }
    if name.starts_with('$') {
        return Err(ChannelNameError::Invalid(
            "Channel names starting with '$' are reserved",
        ));
    }
    if !name.chars().all(|c| c.is_ascii() && !c.is_ascii_control()) {
        return Err(ChannelNameError::Invalid(
            "Channel name contains invalid characters",
        ));
    }
    Ok(())
}

/// The kind of a channel, derived once from its name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Public,
    Private,
    Presence,
}

impl ChannelKind {
    /// Classify a channel name.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is invalid or uses an unsupported prefix.
    pub fn parse(name: &str) -> Result<Self, ChannelNameError> {
        validate_channel_name(name)?;

        if name.starts_with(ENCRYPTED_PREFIX) {
            Err(ChannelNameError::UnknownKind(name.to_string()))
        } else if name.starts_with(PRESENCE_PREFIX) {
            Ok(ChannelKind::Presence)
        } else if name.starts_with(PRIVATE_PREFIX) {
            Ok(ChannelKind::Private)
        } else {
            Ok(ChannelKind::Public)
        }
    }

    /// Get the kind as a string.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ChannelKind::Public => "public",
            ChannelKind::Private => "private",
            ChannelKind::Presence => "presence",
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The local subscribers of one channel.
#[derive(Debug)]
pub struct Channel {
    /// Channel name.
    name: ChannelId,
    /// Subscribed connections.
    subscribers: HashMap<ConnectionId, ConnectionHandle>,
}

impl Channel {
    /// Create a new channel.
    #[must_use]
    pub fn new(name: impl Into<ChannelId>) -> Self {
        Self {
            name: name.into(),
            subscribers: HashMap::new(),
        }
    }

    /// Get the channel name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the number of local subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Check if a connection is subscribed.
    #[must_use]
    pub fn is_subscribed(&self, connection_id: &ConnectionId) -> bool {
        self.subscribers.contains_key(connection_id)
    }

    /// Subscribe a connection to this channel.
    ///
    /// Subscribing twice is a no-op. Returns `true` if this connection is
    /// the channel's first local subscriber.
    pub fn subscribe(&mut self, connection: &ConnectionHandle) -> bool {
        let was_empty = self.subscribers.is_empty();
        if self
            .subscribers
            .insert(connection.id().clone(), connection.clone())
            .is_none()
        {
            debug!(channel = %self.name, connection = %connection.id(), "Connection subscribed");
        }
        was_empty && !self.subscribers.is_empty()
    }

    /// Unsubscribe a connection from this channel.
    ///
    /// Returns `true` if the channel has no local subscribers left.
    pub fn unsubscribe(&mut self, connection_id: &ConnectionId) -> bool {
        if self.subscribers.remove(connection_id).is_some() {
            debug!(channel = %self.name, connection = %connection_id, "Connection unsubscribed");
        }
        self.subscribers.is_empty()
    }

    /// Deliver a message to every local subscriber except `except`.
    ///
    /// Never waits on a connection: a full or closed queue only costs that
    /// connection the message. Returns the number of queues that accepted it.
    pub fn broadcast(&self, message: &Arc<Message>, except: Option<&ConnectionId>) -> usize {
        let mut delivered = 0;
        for (id, connection) in &self.subscribers {
            if except == Some(id) {
                continue;
            }
            match connection.deliver(message) {
                Ok(()) => delivered += 1,
                Err(DeliveryError::Full) => {
                    warn!(channel = %self.name, connection = %id, "Dropping message for slow connection");
                }
                Err(DeliveryError::Closed) => {
                    debug!(channel = %self.name, connection = %id, "Skipping closed connection");
                }
            }
        }
        trace!(channel = %self.name, recipients = delivered, "Broadcast message");
        delivered
    }

    /// Get all subscriber IDs.
    #[must_use]
    pub fn subscribers(&self) -> Vec<ConnectionId> {
        self.subscribers.keys().cloned().collect()
    }

    /// Check if the channel is empty (no subscribers).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }
}
