//! Registry of live connections
//!
//! Internally synchronized map from connection id to handle. Callers never lock
//! anything themselves.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use super::{Connection, ConnectionId};

/// Shared handle to a registered connection
pub type ConnectionHandle = Arc<dyn Connection>;

/// Concurrent set of connections keyed by id
#[derive(Default)]
pub struct Registry {
    connections: RwLock<HashMap<ConnectionId, ConnectionHandle>>,
}

impl Registry {
    /// Add a connection. Returns false if the id was already present, in which case
    /// the existing entry is kept.
    pub fn insert(&self, conn: ConnectionHandle) -> bool {
        let mut connections = self
            .connections
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        let id = conn.id();
        if connections.contains_key(&id) {
            return false;
        }
        connections.insert(id, conn);
        true
    }

    /// Remove a connection by id, returning its handle if it was registered
    pub fn remove(&self, id: ConnectionId) -> Option<ConnectionHandle> {
        self.connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
    }

    /// Check whether a connection is registered
    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&id)
    }

    /// Number of registered connections
    pub fn len(&self) -> usize {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every registered connection except `exclude`
    ///
    /// The lock is released before this returns, so callers can send to the
    /// snapshot while other tasks register or remove connections.
    pub fn snapshot_except(&self, exclude: Option<ConnectionId>) -> Vec<ConnectionHandle> {
        let connections = self
            .connections
            .read()
            .unwrap_or_else(PoisonError::into_inner);

        connections
            .iter()
            .filter(|(id, _)| Some(**id) != exclude)
            .map(|(_, conn)| Arc::clone(conn))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::SendError;

    struct NullConnection(ConnectionId);

    impl Connection for NullConnection {
        fn id(&self) -> ConnectionId {
            self.0
        }

        fn send(&self, _text: &str) -> Result<(), SendError> {
            Ok(())
        }

        fn close(&self) {}
    }

    fn handle(id: ConnectionId) -> ConnectionHandle {
        Arc::new(NullConnection(id))
    }

    #[test]
    fn test_new_registry_is_empty() {
        let registry = Registry::default();
        assert!(registry.is_empty());
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn test_insert_and_remove() {
        let registry = Registry::default();
        let id = ConnectionId::new();

        assert!(registry.insert(handle(id)));
        assert!(registry.contains(id));
        assert_eq!(registry.len(), 1);

        assert!(registry.remove(id).is_some());
        assert!(!registry.contains(id));
        assert!(registry.remove(id).is_none());
    }

    #[test]
    fn test_duplicate_insert_rejected() {
        let registry = Registry::default();
        let id = ConnectionId::new();

        assert!(registry.insert(handle(id)));
        assert!(!registry.insert(handle(id)));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_snapshot_excludes_by_id() {
        let registry = Registry::default();
        let a = ConnectionId::new();
        let b = ConnectionId::new();
        let c = ConnectionId::new();
        for id in [a, b, c] {
            registry.insert(handle(id));
        }

        let mut ids: Vec<_> = registry
            .snapshot_except(Some(a))
            .iter()
            .map(|conn| conn.id())
            .collect();
        ids.sort_by_key(|id| id.to_string());
        let mut expected = vec![b, c];
        expected.sort_by_key(|id| id.to_string());
        assert_eq!(ids, expected);

        assert_eq!(registry.snapshot_except(None).len(), 3);
    }
}
