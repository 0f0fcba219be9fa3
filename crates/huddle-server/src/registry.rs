use std::collections::{HashMap, HashSet};

use huddle_core::{ClientIdentity, ConnectionId};
use parking_lot::RwLock;

use crate::transport::Connection;

/// Result of removing a specific connection from the registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Removal {
    /// The entry belonged to this connection and is gone.
    Removed,
    /// Nothing registered under the identity, and no newer connection has
    /// claimed it since this one was removed.
    Absent,
    /// A newer connection took over the identity; nothing removed.
    Superseded,
}

#[derive(Default)]
struct Entries {
    live: HashMap<ClientIdentity, Connection>,
    /// Connections removed from outside their own session, until that
    /// session unwinds.
    detached: HashMap<ClientIdentity, ConnectionId>,
    /// Connections whose identity was re-registered before their session
    /// unwound.
    taken_over: HashSet<ConnectionId>,
}

impl Entries {
    fn claim(&mut self, identity: ClientIdentity, connection: Connection) -> Option<Connection> {
        if let Some(stale) = self.detached.remove(&identity) {
            self.taken_over.insert(stale);
        }
        let previous = self.live.insert(identity, connection);
        if let Some(previous) = &previous {
            self.taken_over.insert(previous.id().clone());
        }
        previous
    }

    fn detach(&mut self, identity: &ClientIdentity) -> Option<Connection> {
        let removed = self.live.remove(identity)?;
        self.detached.insert(identity.clone(), removed.id().clone());
        Some(removed)
    }
}

/// Live connections keyed by identity.
///
/// Every operation takes the lock for a plain map operation and releases it
/// before returning; nothing awaits while holding it.
#[derive(Default)]
pub struct ConnectionRegistry {
    entries: RwLock<Entries>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace. Returns the connection previously held under
    /// `identity`, if any.
    pub fn register(&self, identity: ClientIdentity, connection: Connection) -> Option<Connection> {
        self.entries.write().claim(identity, connection)
    }

    /// Insert only if `identity` is free; otherwise hand the connection back.
    pub fn register_if_absent(
        &self,
        identity: ClientIdentity,
        connection: Connection,
    ) -> Result<(), Connection> {
        let mut entries = self.entries.write();
        if entries.live.contains_key(&identity) {
            return Err(connection);
        }
        entries.claim(identity, connection);
        Ok(())
    }

    /// Remove whatever is registered under `identity`. No-op when absent.
    pub fn unregister(&self, identity: &ClientIdentity) -> Option<Connection> {
        self.entries.write().detach(identity)
    }

    /// Remove `connection_id`'s entry on behalf of someone other than its
    /// session. Returns whether anything was removed.
    pub fn detach_connection(&self, identity: &ClientIdentity, connection_id: &ConnectionId) -> bool {
        let mut entries = self.entries.write();
        let owned = entries
            .live
            .get(identity)
            .is_some_and(|current| current.id() == connection_id);
        owned && entries.detach(identity).is_some()
    }

    /// Remove the entry only if it still belongs to `connection_id`. Called
    /// once by the connection's own session as it ends.
    pub fn unregister_connection(
        &self,
        identity: &ClientIdentity,
        connection_id: &ConnectionId,
    ) -> Removal {
        let mut entries = self.entries.write();
        if entries.taken_over.remove(connection_id) {
            return Removal::Superseded;
        }
        let owned = entries.live.get(identity).map(|current| current.id() == connection_id);
        match owned {
            Some(true) => {
                entries.live.remove(identity);
                Removal::Removed
            }
            Some(false) => Removal::Superseded,
            None => {
                if entries.detached.get(identity) == Some(connection_id) {
                    entries.detached.remove(identity);
                }
                Removal::Absent
            }
        }
    }

    /// Registered identities, sorted.
    pub fn snapshot(&self) -> Vec<ClientIdentity> {
        let mut roster: Vec<ClientIdentity> = self.entries.read().live.keys().cloned().collect();
        roster.sort();
        roster
    }

    /// Every entry, copied out so delivery can run without the lock.
    pub fn targets(&self) -> Vec<(ClientIdentity, Connection)> {
        self.entries
            .read()
            .live
            .iter()
            .map(|(identity, conn)| (identity.clone(), conn.clone()))
            .collect()
    }

    pub fn get(&self, identity: &ClientIdentity) -> Option<Connection> {
        self.entries.read().live.get(identity).cloned()
    }

    pub fn owner_of(&self, identity: &ClientIdentity) -> Option<ConnectionId> {
        self.entries.read().live.get(identity).map(|c| c.id().clone())
    }

    pub fn contains(&self, identity: &ClientIdentity) -> bool {
        self.entries.read().live.contains_key(identity)
    }

    pub fn len(&self) -> usize {
        self.entries.read().live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().live.is_empty()
    }
}
