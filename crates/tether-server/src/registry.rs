//! Identity → live connection map.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tether_core::{Identity, SessionId};

use crate::connection::{CloseReason, Connection};

/// At most one live connection per identity.
///
/// Replacing an entry closes the previous connection before the new one
/// becomes visible. Removal is conditional on the session id so a late
/// teardown of a superseded connection cannot evict its successor.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: DashMap<Identity, Arc<Connection>>,
}

impl ConnectionRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace. Returns the superseded connection, already told to close.
    pub fn put(&self, conn: Arc<Connection>) -> Option<Arc<Connection>> {
        match self.connections.entry(conn.identity().clone()) {
            Entry::Occupied(mut occupied) => {
                let previous = occupied.get().clone();
                let _ = previous.begin_close(CloseReason::Superseded);
                let _ = occupied.insert(conn);
                Some(previous)
            }
            Entry::Vacant(vacant) => {
                let _ = vacant.insert(conn);
                None
            }
        }
    }

    /// Current connection for `identity`.
    pub fn get(&self, identity: &Identity) -> Option<Arc<Connection>> {
        self.connections.get(identity).map(|entry| Arc::clone(entry.value()))
    }

    /// Remove the entry only if it still belongs to `session_id`.
    pub fn remove(&self, identity: &Identity, session_id: &SessionId) -> bool {
        self.connections
            .remove_if(identity, |_, conn| conn.session_id() == session_id)
            .is_some()
    }

    /// Whether `identity` has a live entry.
    pub fn contains(&self, identity: &Identity) -> bool {
        self.connections.contains_key(identity)
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Point-in-time copy of every live connection.
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }
}
