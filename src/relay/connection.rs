//! Connection abstraction consumed by the relay
//!
//! The relay never touches sockets directly. Anything that can deliver text to one
//! client and be told to close can be registered.

use std::fmt;

use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur when delivering text to a single connection
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SendError {
    #[error("Connection {0} is closed")]
    Closed(ConnectionId),

    #[error("Outbound queue for connection {0} is full")]
    Full(ConnectionId),
}

/// Stable identity of one live connection
///
/// Generated once when the transport accepts a client. A reconnecting client gets a
/// fresh id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Generate a new random connection id
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A client channel the relay can deliver text to
///
/// Implementations must not block on other connections: `send` should hand the text
/// to this connection's own outbound queue and return.
pub trait Connection: Send + Sync {
    /// Identity used for registry membership and sender exclusion
    fn id(&self) -> ConnectionId;

    /// Deliver a text payload to this client
    fn send(&self, text: &str) -> Result<(), SendError>;

    /// Ask the transport to close this connection
    fn close(&self);
}
