//! The presence set: which users hold a live connection on any process.
//!
//! Entries carry the owning node and a lease timestamp. The owning node
//! refreshes leases while the connection lives; a node that dies without
//! clean shutdown stops refreshing, and [`PresenceSet::reap_stale`] removes
//! its entries on the next reconciliation pass.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use relay_core::ids::UserId;

use crate::error::StoreError;

/// Globally shared online set.
#[async_trait]
pub trait PresenceSet: Send + Sync {
    /// Record `user` as online, owned by `node`. Replaces any previous owner.
    async fn mark_online(&self, user: UserId, node: &str) -> Result<(), StoreError>;

    /// Remove `user` if its entry is still owned by `node`.
    ///
    /// A user that already reconnected elsewhere keeps its newer entry.
    async fn mark_offline(&self, user: UserId, node: &str) -> Result<bool, StoreError>;

    /// Renew the leases of `users` owned by `node`.
    async fn refresh(&self, users: &[UserId], node: &str) -> Result<(), StoreError>;

    /// Every user currently considered online.
    async fn members(&self) -> Result<Vec<UserId>, StoreError>;

    /// Remove entries whose lease is older than `older_than`; returns them.
    async fn reap_stale(&self, older_than: Duration) -> Result<Vec<UserId>, StoreError>;
}

struct Lease {
    node: String,
    refreshed: Instant,
}

/// [`PresenceSet`] held in process memory.
///
/// Share one instance between several nodes to model the external cache.
#[derive(Default)]
pub struct MemoryPresence {
    leases: Mutex<HashMap<UserId, Lease>>,
}

impl MemoryPresence {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Owning node of `user`'s entry.
    pub fn owner(&self, user: UserId) -> Option<String> {
        self.leases.lock().get(&user).map(|l| l.node.clone())
    }
}

#[async_trait]
impl PresenceSet for MemoryPresence {
    async fn mark_online(&self, user: UserId, node: &str) -> Result<(), StoreError> {
        let lease = Lease {
            node: node.to_string(),
            refreshed: Instant::now(),
        };
        let _ = self.leases.lock().insert(user, lease);
        Ok(())
    }

    async fn mark_offline(&self, user: UserId, node: &str) -> Result<bool, StoreError> {
        let mut leases = self.leases.lock();
        if leases.get(&user).is_some_and(|l| l.node == node) {
            let _ = leases.remove(&user);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn refresh(&self, users: &[UserId], node: &str) -> Result<(), StoreError> {
        let now = Instant::now();
        let mut leases = self.leases.lock();
        for user in users {
            if let Some(lease) = leases.get_mut(user).filter(|l| l.node == node) {
                lease.refreshed = now;
            }
        }
        Ok(())
    }

    async fn members(&self) -> Result<Vec<UserId>, StoreError> {
        let mut users: Vec<UserId> = self.leases.lock().keys().copied().collect();
        users.sort_unstable();
        Ok(users)
    }

    async fn reap_stale(&self, older_than: Duration) -> Result<Vec<UserId>, StoreError> {
        let mut leases = self.leases.lock();
        let stale: Vec<UserId> = leases
            .iter()
            .filter(|(_, l)| l.refreshed.elapsed() >= older_than)
            .map(|(u, _)| *u)
            .collect();
        for user in &stale {
            let _ = leases.remove(user);
        }
        Ok(stale)
    }
}
