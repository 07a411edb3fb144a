//! Connection registry.
//!
//! Maps each user to the set of their live connections. Shards by user so
//! registrations for different users never contend.

use dashmap::DashMap;
use herald_protocol::UserId;
use herald_transport::ConnectionId;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, trace};

use crate::connection::Connection;

/// Point-in-time counts taken in a single pass over the registry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistrySnapshot {
    /// Total registered connections.
    pub connections: usize,
    /// Users with at least one connection.
    pub users: usize,
    /// Connections-per-user histogram: connections held → number of users.
    pub per_user: BTreeMap<usize, usize>,
}

/// Registry of live connections keyed by user.
#[derive(Debug, Default)]
pub struct Registry {
    users: DashMap<UserId, HashMap<ConnectionId, Arc<Connection>>>,
}

impl Registry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection under a user, creating the user's set if absent.
    ///
    /// Returns `false` if a connection with the same ID was already present
    /// for that user; the existing entry is replaced.
    pub fn add(&self, user_id: UserId, conn: Arc<Connection>) -> bool {
        let id = conn.id().clone();
        let replaced = self
            .users
            .entry(user_id.clone())
            .or_default()
            .insert(id.clone(), conn)
            .is_some();

        debug!(user = %user_id, connection = %id, "Connection registered");
        !replaced
    }

    /// Deregister a connection.
    ///
    /// Drops the user entry once their last connection is gone. Removing an
    /// unknown connection is a no-op that returns `None`.
    pub fn remove(&self, user_id: &UserId, id: &ConnectionId) -> Option<Arc<Connection>> {
        let removed = match self.users.entry(user_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(mut entry) => {
                let removed = entry.get_mut().remove(id);
                if entry.get().is_empty() {
                    entry.remove();
                }
                removed
            }
            dashmap::mapref::entry::Entry::Vacant(_) => None,
        };

        if removed.is_some() {
            debug!(user = %user_id, connection = %id, "Connection deregistered");
        } else {
            trace!(user = %user_id, connection = %id, "Deregistering unknown connection");
        }
        removed
    }

    /// Get a snapshot of a user's connections.
    #[must_use]
    pub fn lookup(&self, user_id: &UserId) -> Vec<Arc<Connection>> {
        self.users
            .get(user_id)
            .map(|conns| conns.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Users with at least one connection.
    ///
    /// The iterator walks a snapshot and holds no shard lock, so it is safe
    /// to call back into the registry while consuming it.
    pub fn all_users(&self) -> impl Iterator<Item = UserId> {
        self.users
            .iter()
            .map(|entry| entry.key().clone())
            .collect::<Vec<_>>()
            .into_iter()
    }

    /// Snapshot of every registered connection.
    #[must_use]
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.users
            .iter()
            .flat_map(|entry| entry.value().values().cloned().collect::<Vec<_>>())
            .collect()
    }

    /// Total connections and distinct users.
    #[must_use]
    pub fn count(&self) -> (usize, usize) {
        let snapshot = self.snapshot();
        (snapshot.connections, snapshot.users)
    }

    /// Counts and the per-user histogram from one pass.
    #[must_use]
    pub fn snapshot(&self) -> RegistrySnapshot {
        let mut snapshot = RegistrySnapshot::default();
        for entry in self.users.iter() {
            let held = entry.value().len();
            if held == 0 {
                continue;
            }
            snapshot.connections += held;
            snapshot.users += 1;
            *snapshot.per_user.entry(held).or_insert(0) += 1;
        }
        snapshot
    }

    /// Check if no connections are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn(user: &str, id: &str) -> (UserId, Arc<Connection>) {
        let user = UserId::new(user);
        let conn = Arc::new(Connection::new(ConnectionId::new(id), user.clone(), 4));
        (user, conn)
    }

    fn add(registry: &Registry, user: &str, id: &str) -> bool {
        let (user, conn) = conn(user, id);
        registry.add(user, conn)
    }

    #[test]
    fn test_add_and_lookup() {
        let registry = Registry::new();
        assert!(add(&registry, "alice", "c1"));
        assert!(add(&registry, "alice", "c2"));
        assert!(add(&registry, "bob", "c3"));

        assert_eq!(registry.lookup(&UserId::new("alice")).len(), 2);
        assert_eq!(registry.lookup(&UserId::new("bob")).len(), 1);
        assert!(registry.lookup(&UserId::new("carol")).is_empty());
        assert_eq!(registry.count(), (3, 2));
    }

    #[test]
    fn test_duplicate_add_replaces() {
        let registry = Registry::new();
        assert!(add(&registry, "alice", "c1"));
        assert!(!add(&registry, "alice", "c1"));
        assert_eq!(registry.count(), (1, 1));
    }

    #[test]
    fn test_remove_last_connection_drops_user() {
        let registry = Registry::new();
        let alice = UserId::new("alice");
        add(&registry, "alice", "c1");
        add(&registry, "alice", "c2");

        assert!(registry.remove(&alice, &ConnectionId::new("c1")).is_some());
        assert_eq!(registry.all_users().collect::<Vec<_>>(), vec![alice.clone()]);

        assert!(registry.remove(&alice, &ConnectionId::new("c2")).is_some());
        assert_eq!(registry.all_users().count(), 0);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_remove_unknown_is_noop() {
        let registry = Registry::new();
        add(&registry, "alice", "c1");

        assert!(registry
            .remove(&UserId::new("alice"), &ConnectionId::new("nope"))
            .is_none());
        assert!(registry
            .remove(&UserId::new("bob"), &ConnectionId::new("c1"))
            .is_none());
        assert_eq!(registry.count(), (1, 1));
    }

    #[test]
    fn test_snapshot_histogram() {
        let registry = Registry::new();
        add(&registry, "alice", "c1");
        add(&registry, "alice", "c2");
        add(&registry, "bob", "c3");
        add(&registry, "carol", "c4");

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.connections, 4);
        assert_eq!(snapshot.users, 3);
        assert_eq!(snapshot.per_user.get(&1), Some(&2));
        assert_eq!(snapshot.per_user.get(&2), Some(&1));
    }

    #[test]
    fn test_random_churn_keeps_counts_consistent() {
        let registry = Registry::new();
        let mut live: Vec<(UserId, ConnectionId)> = Vec::new();
        let mut seed: u64 = 0x5eed;
        let mut next = || {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            (seed >> 33) as usize
        };

        for step in 0..2_000 {
            if live.is_empty() || next() % 3 != 0 {
                let user = UserId::new(format!("user-{}", next() % 17));
                let id = ConnectionId::new(format!("conn-{step}"));
                registry.add(user.clone(), Arc::new(Connection::new(id.clone(), user.clone(), 1)));
                live.push((user, id));
            } else {
                let index = next() % live.len();
                let (user, id) = live.swap_remove(index);
                assert!(registry.remove(&user, &id).is_some());
            }

            if step % 100 == 0 {
                let mut users: Vec<_> = live.iter().map(|(u, _)| u.clone()).collect();
                users.sort();
                users.dedup();
                assert_eq!(registry.count(), (live.len(), users.len()));
            }
        }

        for (user, id) in live.drain(..) {
            registry.remove(&user, &id);
        }
        assert!(registry.is_empty());
    }

    #[test]
    fn test_concurrent_add_remove() {
        let registry = Arc::new(Registry::new());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    let user = UserId::new(format!("user-{}", t % 2));
                    for i in 0..200 {
                        let id = ConnectionId::new(format!("t{t}-c{i}"));
                        registry.add(user.clone(), Arc::new(Connection::new(id.clone(), user.clone(), 1)));
                        registry.remove(&user, &id);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert!(registry.is_empty());
        assert_eq!(registry.count(), (0, 0));
    }
}
