//! Broadcast relay
//!
//! Receives lifecycle callbacks from the transport and fans every incoming message
//! out to all other registered connections.
//! Delivery is best effort: failed sends are logged and never retried, and a failing
//! recipient stays registered until the transport reports it closed.

use std::error::Error;

use tracing::{debug, info, warn};

use super::{ConnectionHandle, ConnectionId, Registry};

/// Text sent to a client right after it is registered
pub const WELCOME_MESSAGE: &str = "Connection established.";

/// Summary of one fan-out, for logging and diagnostics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastOutcome {
    /// Recipients whose send succeeded
    pub delivered: usize,
    /// Recipients whose send failed
    pub failed: usize,
}

/// Relays messages between all connected clients
#[derive(Default)]
pub struct BroadcastRelay {
    registry: Registry,
}

impl BroadcastRelay {
    /// Create a relay with an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Greet a newly opened connection, then register it
    ///
    /// The welcome is queued before the connection becomes visible to broadcasts, so
    /// it is always the first message the client sees.
    pub fn on_open(&self, conn: ConnectionHandle) {
        let id = conn.id();

        if self.registry.contains(id) {
            warn!("Connection {} opened twice, ignoring", id);
            return;
        }

        if let Err(e) = conn.send(WELCOME_MESSAGE) {
            warn!("Failed to send welcome to {}: {}", id, e);
        }

        if !self.registry.insert(conn) {
            warn!("Connection {} opened twice, ignoring", id);
            return;
        }
        info!("Connection {} opened ({} active)", id, self.registry.len());
    }

    /// Forward `payload` to every registered connection except the sender
    pub fn on_message(&self, sender: ConnectionId, payload: &str) -> BroadcastOutcome {
        debug!("Message from {} ({} bytes)", sender, payload.len());

        let recipients = self.registry.snapshot_except(Some(sender));
        let mut outcome = BroadcastOutcome::default();

        for conn in recipients {
            match conn.send(payload) {
                Ok(()) => outcome.delivered += 1,
                Err(e) => {
                    warn!("Failed to relay message from {} to {}: {}", sender, conn.id(), e);
                    outcome.failed += 1;
                }
            }
        }

        debug!(
            "Relayed message from {} to {} clients ({} failed)",
            sender, outcome.delivered, outcome.failed
        );
        outcome
    }

    /// Deregister a connection that closed normally. No-op if it is not registered.
    pub fn on_close(&self, id: ConnectionId) {
        if self.registry.remove(id).is_some() {
            info!("Connection {} closed ({} active)", id, self.registry.len());
        } else {
            debug!("Close for unregistered connection {}", id);
        }
    }

    /// Deregister a connection after a transport fault
    pub fn on_error(&self, id: ConnectionId, err: &dyn Error) {
        warn!("Connection {} error: {}", id, err);
        if self.registry.remove(id).is_some() {
            info!("Connection {} dropped after error ({} active)", id, self.registry.len());
        }
    }

    /// Ask every registered connection to close
    ///
    /// Connections stay registered until the transport reports them closed.
    pub fn close_all(&self) {
        if self.registry.is_empty() {
            return;
        }

        let connections = self.registry.snapshot_except(None);
        info!("Closing {} connections", connections.len());
        for conn in connections {
            conn.close();
        }
    }

    /// Number of registered connections
    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    /// Check whether a connection is registered
    #[allow(dead_code)]
    pub fn is_registered(&self, id: ConnectionId) -> bool {
        self.registry.contains(id)
    }
}
