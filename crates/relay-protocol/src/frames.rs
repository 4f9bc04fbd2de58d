//! Frame types exchanged between clients and the Relay server.
//!
//! Frames are serialized with MessagePack and length-prefixed by the codec.

use serde::{Deserialize, Serialize};

/// Protocol version announced in the `Connected` frame.
pub const PROTOCOL_VERSION: u8 = 1;

/// Identity a connection asserts when subscribing to a presence channel.
///
/// The server trusts this data; signature checks happen before a
/// connection reaches the channel layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceData {
    /// Logical user identifier.
    pub user_id: String,
    /// Arbitrary user metadata shared with other members.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_info: Option<serde_json::Value>,
}

/// A protocol frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    /// Subscribe to a channel.
    #[serde(rename = "subscribe")]
    Subscribe {
        /// Request ID for acknowledgment.
        id: u64,
        /// Channel name to subscribe to.
        channel: String,
        /// Member identity, required for presence channels.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        presence: Option<PresenceData>,
    },

    /// Unsubscribe from a channel.
    #[serde(rename = "unsubscribe")]
    Unsubscribe {
        /// Request ID for acknowledgment.
        id: u64,
        /// Channel name to unsubscribe from.
        channel: String,
    },

    /// An event on a channel, in either direction.
    #[serde(rename = "publish")]
    Publish {
        /// Optional request ID for acknowledgment.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
        /// Target channel.
        channel: String,
        /// Optional event name.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        event: Option<String>,
        /// Event payload.
        #[serde(with = "serde_bytes")]
        payload: Vec<u8>,
    },

    /// Acknowledgment of a request.
    #[serde(rename = "ack")]
    Ack {
        /// ID of the acknowledged request.
        id: u64,
    },

    /// Error response.
    #[serde(rename = "error")]
    Error {
        /// ID of the failed request (0 if not applicable).
        id: u64,
        /// Error code.
        code: u16,
        /// Human-readable error message.
        message: String,
    },

    /// Keepalive ping.
    #[serde(rename = "ping")]
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    /// Keepalive pong.
    #[serde(rename = "pong")]
    Pong {
        /// Echoed timestamp from ping.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    /// Connection established response.
    #[serde(rename = "connected")]
    Connected {
        /// Unique connection identifier (the socket id).
        connection_id: String,
        /// Protocol version.
        version: u8,
        /// Recommended heartbeat interval in milliseconds.
        heartbeat: u32,
    },
}

impl Frame {
    /// The `type` tag this frame is serialized with.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Subscribe { .. } => "subscribe",
            Frame::Unsubscribe { .. } => "unsubscribe",
            Frame::Publish { .. } => "publish",
            Frame::Ack { .. } => "ack",
            Frame::Error { .. } => "error",
            Frame::Ping { .. } => "ping",
            Frame::Pong { .. } => "pong",
            Frame::Connected { .. } => "connected",
        }
    }

    /// Create a new Subscribe frame.
    #[must_use]
    pub fn subscribe(id: u64, channel: impl Into<String>) -> Self {
        Frame::Subscribe {
            id,
            channel: channel.into(),
            presence: None,
        }
    }

    /// Create a Subscribe frame for a presence channel.
    #[must_use]
    pub fn subscribe_presence(
        id: u64,
        channel: impl Into<String>,
        user_id: impl Into<String>,
        user_info: Option<serde_json::Value>,
    ) -> Self {
        Frame::Subscribe {
            id,
            channel: channel.into(),
            presence: Some(PresenceData {
                user_id: user_id.into(),
                user_info,
            }),
        }
    }

    /// Create a new Unsubscribe frame.
    #[must_use]
    pub fn unsubscribe(id: u64, channel: impl Into<String>) -> Self {
        Frame::Unsubscribe {
            id,
            channel: channel.into(),
        }
    }

    /// Create a new Publish frame.
    #[must_use]
    pub fn publish(channel: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Frame::Publish {
            id: None,
            channel: channel.into(),
            event: None,
            payload: payload.into(),
        }
    }

    /// Create a Publish frame carrying a named event.
    #[must_use]
    pub fn event(
        channel: impl Into<String>,
        event: impl Into<String>,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        Frame::Publish {
            id: None,
            channel: channel.into(),
            event: Some(event.into()),
            payload: payload.into(),
        }
    }

    /// Create a new Ack frame.
    #[must_use]
    pub fn ack(id: u64) -> Self {
        Frame::Ack { id }
    }

    /// Create a new Error frame.
    #[must_use]
    pub fn error(id: u64, code: u16, message: impl Into<String>) -> Self {
        Frame::Error {
            id,
            code,
            message: message.into(),
        }
    }

    /// Create a new Ping frame.
    #[must_use]
    pub fn ping() -> Self {
        Frame::Ping { timestamp: None }
    }

    /// Create a new Pong frame.
    #[must_use]
    pub fn pong(timestamp: Option<u64>) -> Self {
        Frame::Pong { timestamp }
    }

    /// Create a new Connected frame.
    #[must_use]
    pub fn connected(connection_id: impl Into<String>, heartbeat: u32) -> Self {
        Frame::Connected {
            connection_id: connection_id.into(),
            version: PROTOCOL_VERSION,
            heartbeat,
        }
    }
}
