//! Local connection handles.
//!
//! A connection belongs to the process that accepted its socket. The core
//! only ever sees a handle: an id plus the sending half of the
//! connection's outbound queue.

use crate::message::Message;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};

static CONNECTION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Unique identifier for a connection (the socket id).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub String);

impl ConnectionId {
    /// Create a new connection ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a connection ID unique within this process.
    #[must_use]
    pub fn generate() -> Self {
        use std::time::{SystemTime, UNIX_EPOCH};
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let counter = CONNECTION_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(format!("conn_{:x}.{}", timestamp, counter))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ConnectionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Why a message did not reach a connection's queue.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeliveryError {
    /// The connection is not draining its queue fast enough.
    #[error("Connection queue is full")]
    Full,

    /// The connection has gone away.
    #[error("Connection is closed")]
    Closed,
}

/// Handle to a local connection's outbound queue.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    sender: mpsc::Sender<Arc<Message>>,
}

impl ConnectionHandle {
    /// Wrap an existing queue sender.
    #[must_use]
    pub fn new(id: ConnectionId, sender: mpsc::Sender<Arc<Message>>) -> Self {
        Self { id, sender }
    }

    /// Create a handle together with the receiving end of its queue.
    #[must_use]
    pub fn channel(
        id: impl Into<ConnectionId>,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<Arc<Message>>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self::new(id.into(), sender), receiver)
    }

    /// Get the connection ID.
    #[must_use]
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Queue a message without waiting.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue is full or the connection is gone.
    pub fn deliver(&self, message: &Arc<Message>) -> Result<(), DeliveryError> {
        self.sender
            .try_send(Arc::clone(message))
            .map_err(|e| match e {
                TrySendError::Full(_) => DeliveryError::Full,
                TrySendError::Closed(_) => DeliveryError::Closed,
            })
    }

    /// Check if the connection has gone away.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}
