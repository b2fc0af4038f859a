//! Connection Registry
//!
//! The authoritative set of open connections. The listener inserts, each
//! reader removes itself when it terminates, and the controller takes
//! snapshots while both are happening.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use super::handle::{ConnectionHandle, ConnectionInfo};
use crate::event::ConnectionId;

/// Thread-safe registry of live connections
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<ConnectionHandle>>,
    total_registered: AtomicU64,
    total_bytes_received: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection
    pub fn add(&self, handle: Arc<ConnectionHandle>) {
        debug!("Registering connection {} from {}", handle.id(), handle.remote());
        self.total_registered.fetch_add(1, Ordering::Relaxed);
        self.connections.insert(handle.id(), handle);
    }

    /// Remove a connection; returns the handle if it was still present
    pub fn remove(&self, id: ConnectionId) -> Option<Arc<ConnectionHandle>> {
        self.connections.remove(&id).map(|(_, handle)| handle)
    }

    /// Point-in-time copy of the open connections, in acceptance order
    pub fn snapshot(&self) -> Vec<Arc<ConnectionHandle>> {
        let mut handles: Vec<_> = self
            .connections
            .iter()
            .filter(|entry| entry.value().is_open())
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        handles.sort_by_key(|handle| handle.id());
        handles
    }

    /// Info for every open connection, in acceptance order
    pub fn infos(&self) -> Vec<ConnectionInfo> {
        self.snapshot().iter().map(|handle| handle.info()).collect()
    }

    /// Number of open connections. Entries already closed but whose reader
    /// has not deregistered yet are not counted.
    pub fn count(&self) -> usize {
        self.connections
            .iter()
            .filter(|entry| entry.value().is_open())
            .count()
    }

    /// Entries still present, including closed ones awaiting their reader
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// `true` once every reader has deregistered
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Drop every entry, returning how many were still present
    pub fn clear(&self) -> usize {
        let stale = self.connections.len();
        self.connections.clear();
        stale
    }

    pub(crate) fn record_received(&self, bytes: usize) {
        self.total_bytes_received
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Connections registered since the registry was created
    pub fn total_registered(&self) -> u64 {
        self.total_registered.load(Ordering::Relaxed)
    }

    /// Bytes received across all connections, closed ones included
    pub fn total_bytes_received(&self) -> u64 {
        self.total_bytes_received.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(id: u64) -> Arc<ConnectionHandle> {
        let remote = format!("127.0.0.1:{}", 6000 + id).parse().unwrap();
        Arc::new(ConnectionHandle::new(ConnectionId(id), remote))
    }

    #[test]
    fn test_add_remove_count() {
        let registry = ConnectionRegistry::new();
        registry.add(handle(1));
        registry.add(handle(2));
        assert_eq!(registry.count(), 2);

        assert!(registry.remove(ConnectionId(1)).is_some());
        assert!(registry.remove(ConnectionId(1)).is_none());
        assert_eq!(registry.count(), 1);
        assert_eq!(registry.total_registered(), 2);
    }

    #[test]
    fn test_snapshot_is_ordered_and_skips_closed() {
        let registry = ConnectionRegistry::new();
        for id in [3, 1, 2] {
            registry.add(handle(id));
        }
        let ids: Vec<_> = registry.snapshot().iter().map(|h| h.id().0).collect();
        assert_eq!(ids, vec![1, 2, 3]);

        registry.snapshot()[1].close();
        let ids: Vec<_> = registry.snapshot().iter().map(|h| h.id().0).collect();
        assert_eq!(ids, vec![1, 3]);
    }

    #[test]
    fn test_count_matches_snapshot_while_closing() {
        let registry = ConnectionRegistry::new();
        for id in 1..=3 {
            registry.add(handle(id));
        }

        // Closed from outside; the reader has not removed it yet
        registry.snapshot()[0].close();
        assert_eq!(registry.count(), 2);
        assert_eq!(registry.count(), registry.snapshot().len());
        assert_eq!(registry.infos().len(), 2);
        assert_eq!(registry.len(), 3);
        assert!(!registry.is_empty());

        registry.remove(ConnectionId(1));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_snapshot_survives_concurrent_mutation() {
        let registry = Arc::new(ConnectionRegistry::new());
        for id in 0..100 {
            registry.add(handle(id));
        }

        let remover = {
            let registry = Arc::clone(&registry);
            std::thread::spawn(move || {
                for id in 0..100 {
                    registry.remove(ConnectionId(id));
                }
            })
        };
        for handle in registry.snapshot() {
            handle.close();
        }
        remover.join().unwrap();

        assert!(registry.is_empty());
        assert_eq!(registry.clear(), 0);
    }
}
