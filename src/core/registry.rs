// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Process-wide peer registry: PID → connection, with a secondary index
//! by internal connection id.
//!
//! Shared by the application (`connect`/`disconnect`) and the progress
//! engine (incoming message routing). `DashMap`'s per-shard locking is
//! the only lock on the connection-lookup hot path.

use crate::connection::Connection;
use crate::core::pid::Pid;
use dashmap::DashMap;
use std::sync::Arc;

/// Maps peer PID to connection, indexed also by internal connection id.
#[derive(Default)]
pub struct Registry {
    by_pid: DashMap<Pid, Arc<Connection>>,
    by_id: DashMap<u64, Arc<Connection>>,
}

impl Registry {
    #[must_use]
    pub fn new() -> Registry {
        Registry {
            by_pid: DashMap::new(),
            by_id: DashMap::new(),
        }
    }

    /// Inserts `conn` under its PID, unless a connection for that PID
    /// already exists (first insertion wins).
    ///
    /// Returns `true` if this call performed the insertion.
    pub fn insert(&self, conn: Arc<Connection>) -> bool {
        match self.by_pid.entry(conn.pid()) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                self.by_id.insert(conn.id(), conn.clone());
                slot.insert(conn);
                true
            }
        }
    }

    #[must_use]
    pub fn get_by_pid(&self, pid: Pid) -> Option<Arc<Connection>> {
        self.by_pid.get(&pid).map(|e| e.value().clone())
    }

    #[must_use]
    pub fn get_by_id(&self, id: u64) -> Option<Arc<Connection>> {
        self.by_id.get(&id).map(|e| e.value().clone())
    }

    /// Removes `conn` from both indices. A no-op if it was already absent.
    pub fn remove(&self, conn: &Connection) {
        self.by_pid.remove(&conn.pid());
        self.by_id.remove(&conn.id());
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_pid.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_pid.is_empty()
    }

    /// A point-in-time snapshot of all connections. Iterating the
    /// snapshot never observes mutation from the progress engine mid-scan.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.by_pid.iter().map(|e| e.value().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionResources;
    use std::net::Ipv4Addr;

    fn pid_for(last_octet: u8) -> Pid {
        Pid::pack(Ipv4Addr::new(10, 0, 0, last_octet), 9000)
    }

    #[test]
    fn insert_then_get_by_pid_round_trips() {
        let registry = Registry::new();
        let conn = Arc::new(Connection::new(pid_for(1), ConnectionResources::Loopback));
        assert!(registry.insert(conn.clone()));
        assert_eq!(registry.get_by_pid(pid_for(1)).unwrap().id(), conn.id());
    }

    #[test]
    fn first_insertion_wins() {
        let registry = Registry::new();
        let first = Arc::new(Connection::new(pid_for(1), ConnectionResources::Loopback));
        let second = Arc::new(Connection::new(pid_for(1), ConnectionResources::Loopback));
        assert!(registry.insert(first.clone()));
        assert!(!registry.insert(second));
        assert_eq!(registry.get_by_pid(pid_for(1)).unwrap().id(), first.id());
    }

    #[test]
    fn remove_clears_both_indices() {
        let registry = Registry::new();
        let conn = Arc::new(Connection::new(pid_for(2), ConnectionResources::Loopback));
        registry.insert(conn.clone());
        registry.remove(&conn);
        assert!(registry.get_by_pid(pid_for(2)).is_none());
        assert!(registry.get_by_id(conn.id()).is_none());
    }

    #[test]
    fn get_by_id_matches_get_by_pid() {
        let registry = Registry::new();
        let conn = Arc::new(Connection::new(pid_for(3), ConnectionResources::Loopback));
        registry.insert(conn.clone());
        assert_eq!(
            registry.get_by_id(conn.id()).unwrap().pid(),
            registry.get_by_pid(pid_for(3)).unwrap().pid()
        );
    }

    #[test]
    fn snapshot_reflects_current_membership() {
        let registry = Registry::new();
        registry.insert(Arc::new(Connection::new(pid_for(4), ConnectionResources::Loopback)));
        registry.insert(Arc::new(Connection::new(pid_for(5), ConnectionResources::Loopback)));
        assert_eq!(registry.snapshot().len(), 2);
    }
}
