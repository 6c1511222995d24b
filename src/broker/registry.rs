//! Live connection table
//!
//! Maps a client identity to its connection. Removal is identity-checked so
//! that tearing down a connection that was already replaced by a newer one
//! with the same id never evicts the newer entry.

use std::sync::Arc;

use dashmap::DashMap;

use super::Connection;

#[derive(Default)]
pub struct ClientRegistry {
    entries: DashMap<Arc<str>, Arc<Connection>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(&self, client_id: &str) -> Option<Arc<Connection>> {
        self.entries.get(client_id).map(|e| e.value().clone())
    }

    /// Insert `conn`, returning the connection previously stored under its id
    pub fn store(&self, conn: Arc<Connection>) -> Option<Arc<Connection>> {
        self.entries.insert(conn.client_id().clone(), conn)
    }

    /// Remove the entry for `conn`'s id only if it still points at `conn`
    pub fn delete(&self, conn: &Arc<Connection>) -> bool {
        self.entries
            .remove_if(conn.client_id().as_ref(), |_, stored| {
                Arc::ptr_eq(stored, conn)
            })
            .is_some()
    }

    /// Visit every entry until `f` returns false
    ///
    /// The visitor runs on a snapshot, so it may call back into the registry.
    pub fn range<F>(&self, mut f: F)
    where
        F: FnMut(&Arc<Connection>) -> bool,
    {
        for conn in self.snapshot() {
            if !f(&conn) {
                break;
            }
        }
    }

    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.entries.iter().map(|e| e.value().clone()).collect()
    }

    pub fn contains(&self, client_id: &str) -> bool {
        self.entries.contains_key(client_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
