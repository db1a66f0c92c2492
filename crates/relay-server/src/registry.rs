//! The connection registry.
//!
//! Maps each user to at most one live [`ConnectionHandle`] in this process,
//! enforces the connection cap, and mirrors membership into the shared
//! [`PresenceSet`]. The entry map and the count change together under one
//! async mutex. Presence writes and status hand-offs to the
//! [`StatusNotifier`] happen inside it, so both follow the map's order.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metrics::{counter, gauge};
use relay_core::RelayError;
use relay_core::chat::{PresenceStatus, UserStatus};
use relay_core::ids::UserId;
use relay_store::PresenceSet;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::Identity;
use crate::connection::{ConnectionHandle, EnqueueOutcome, Frame};
use crate::metrics::{
    PRESENCE_REAPED_TOTAL, REGISTRY_BROADCAST_DROPS_TOTAL, REGISTRY_CONNECTIONS,
    REGISTRY_EVICTIONS_TOTAL, REGISTRY_SATURATED_TOTAL,
};

/// Receives presence transitions produced by the registry.
///
/// Admission and eviction call the notifier with the registry lock held, so
/// per-user transitions arrive in the order they happened. Implementations
/// must hand the status off without waiting on I/O.
#[async_trait]
pub trait StatusNotifier: Send + Sync {
    /// Announce `status`. Must not fail the caller.
    async fn user_status(&self, status: UserStatus);
}

/// Discards every status change.
pub struct NoopNotifier;

#[async_trait]
impl StatusNotifier for NoopNotifier {
    async fn user_status(&self, _status: UserStatus) {}
}

/// Registry limits.
#[derive(Clone, Debug)]
pub struct RegistryConfig {
    /// Maximum local connections.
    pub max_connections: usize,
    /// Outbound queue capacity per connection.
    pub send_queue_capacity: usize,
    /// Inbound silence after which a connection fails its probe.
    pub idle_timeout: Duration,
    /// Presence lease age after which an entry is reaped.
    pub presence_stale_after: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_connections: 10_000,
            send_queue_capacity: 256,
            idle_timeout: Duration::from_secs(60),
            presence_stale_after: Duration::from_secs(600),
        }
    }
}

/// A newly admitted connection.
pub struct Admission {
    /// The registered handle.
    pub handle: Arc<ConnectionHandle>,
    /// Receiving end of its outbound queue, for the session pump.
    pub outbound: mpsc::Receiver<Frame>,
    /// Whether an older connection of the same user was replaced.
    pub replaced: bool,
}

/// Outcome of one [`ConnectionRegistry::sweep`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Local connections probed.
    pub probed: usize,
    /// Connections evicted for failing the probe.
    pub evicted: usize,
    /// Presence entries from other (dead) processes removed.
    pub reaped: Vec<UserId>,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<UserId, Arc<ConnectionHandle>>,
    count: usize,
}

/// Per-process registry of live connections.
pub struct ConnectionRegistry {
    inner: Mutex<Inner>,
    config: RegistryConfig,
    node_id: String,
    presence: Arc<dyn PresenceSet>,
    notifier: Arc<dyn StatusNotifier>,
}

impl ConnectionRegistry {
    /// Create an empty registry owned by `node_id`.
    pub fn new(
        config: RegistryConfig,
        node_id: impl Into<String>,
        presence: Arc<dyn PresenceSet>,
        notifier: Arc<dyn StatusNotifier>,
    ) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            config,
            node_id: node_id.into(),
            presence,
            notifier,
        }
    }

    /// Node id written into presence entries.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Registry limits.
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Register a new connection for `identity`.
    ///
    /// Refused with [`RelayError::ConnectionSaturated`] when the cap is
    /// reached. An existing connection for the same user is closed and
    /// replaced.
    pub async fn admit(&self, identity: &Identity) -> Result<Admission, RelayError> {
        let (handle, outbound) = ConnectionHandle::new(
            identity.user_id,
            identity.display_name.clone(),
            self.config.send_queue_capacity,
        );

        let replaced = {
            let mut inner = self.inner.lock().await;
            if inner.count >= self.config.max_connections {
                counter!(REGISTRY_SATURATED_TOTAL).increment(1);
                warn!(user_id = %identity.user_id, cap = self.config.max_connections, "connection cap reached");
                return Err(RelayError::ConnectionSaturated {
                    cap: self.config.max_connections,
                });
            }
            let previous = inner.entries.insert(identity.user_id, Arc::clone(&handle));
            if let Some(old) = &previous {
                let _ = old.close();
                counter!(REGISTRY_EVICTIONS_TOTAL, "reason" => "replaced").increment(1);
            } else {
                inner.count += 1;
            }
            if let Err(e) = self.presence.mark_online(identity.user_id, &self.node_id).await {
                warn!(user_id = %identity.user_id, error = %e, "presence mark_online failed");
            }
            gauge!(REGISTRY_CONNECTIONS).set(count_f64(inner.count));
            self.notifier
                .user_status(UserStatus {
                    user_id: identity.user_id,
                    username: identity.display_name.clone(),
                    status: PresenceStatus::Online,
                })
                .await;
            previous.is_some()
        };

        info!(
            user_id = %identity.user_id,
            conn_id = handle.id(),
            replaced,
            "connection admitted"
        );

        Ok(Admission {
            handle,
            outbound,
            replaced,
        })
    }

    /// Remove `handle` if it is still the registered connection for its user.
    ///
    /// The handle is closed either way. Returns `true` if an entry was
    /// removed (and an offline status published).
    pub async fn evict(&self, handle: &Arc<ConnectionHandle>) -> bool {
        let user = handle.user_id();
        let removed = {
            let mut inner = self.inner.lock().await;
            let current = inner.entries.get(&user).is_some_and(|h| Arc::ptr_eq(h, handle));
            if current {
                let _ = inner.entries.remove(&user);
                inner.count -= 1;
                if let Err(e) = self.presence.mark_offline(user, &self.node_id).await {
                    warn!(user_id = %user, error = %e, "presence mark_offline failed");
                }
                gauge!(REGISTRY_CONNECTIONS).set(count_f64(inner.count));
                self.notifier
                    .user_status(UserStatus {
                        user_id: user,
                        username: handle.display_name().to_string(),
                        status: PresenceStatus::Offline,
                    })
                    .await;
            }
            current
        };
        let _ = handle.close();

        if removed {
            info!(user_id = %user, conn_id = handle.id(), "connection evicted");
        }
        removed
    }

    /// Enqueue `frame` for `user`'s local connection.
    ///
    /// Returns `false` if the user has no local connection, or if its queue
    /// was full or closed; in the latter cases the connection is evicted.
    /// Never waits on the queue.
    pub async fn deliver(&self, user: UserId, frame: Frame) -> bool {
        let Some(handle) = self.get(user).await else {
            return false;
        };
        match handle.try_enqueue(frame) {
            EnqueueOutcome::Queued => true,
            EnqueueOutcome::Full => {
                warn!(
                    user_id = %user,
                    conn_id = handle.id(),
                    "{}",
                    RelayError::UnresponsiveConnection(user)
                );
                if self.evict(&handle).await {
                    counter!(REGISTRY_EVICTIONS_TOTAL, "reason" => "queue_full").increment(1);
                }
                false
            }
            EnqueueOutcome::Closed => {
                if self.evict(&handle).await {
                    counter!(REGISTRY_EVICTIONS_TOTAL, "reason" => "closed").increment(1);
                }
                false
            }
        }
    }

    /// Enqueue `frame` on every local connection; returns how many accepted it.
    ///
    /// Full queues are skipped, not evicted.
    pub async fn broadcast(&self, frame: Frame) -> usize {
        let handles = self.handles().await;
        let mut delivered = 0;
        for handle in handles {
            match handle.try_enqueue(Arc::clone(&frame)) {
                EnqueueOutcome::Queued => delivered += 1,
                EnqueueOutcome::Full => {
                    counter!(REGISTRY_BROADCAST_DROPS_TOTAL).increment(1);
                    debug!(user_id = %handle.user_id(), "broadcast skipped full queue");
                }
                EnqueueOutcome::Closed => {}
            }
        }
        delivered
    }

    /// Probe every local connection, evict failures, renew this node's
    /// presence leases and reap leases left behind by dead processes.
    pub async fn sweep(&self) -> SweepReport {
        let handles = self.handles().await;
        let mut report = SweepReport {
            probed: handles.len(),
            ..SweepReport::default()
        };
        for handle in &handles {
            if !handle.probe(self.config.idle_timeout) && self.evict(handle).await {
                counter!(REGISTRY_EVICTIONS_TOTAL, "reason" => "probe").increment(1);
                report.evicted += 1;
            }
        }

        let live = self.local_users().await;
        if let Err(e) = self.presence.refresh(&live, &self.node_id).await {
            warn!(error = %e, "presence refresh failed");
        }
        match self.presence.reap_stale(self.config.presence_stale_after).await {
            Ok(reaped) => {
                for user in &reaped {
                    counter!(PRESENCE_REAPED_TOTAL).increment(1);
                    self.notifier
                        .user_status(UserStatus {
                            user_id: *user,
                            username: String::new(),
                            status: PresenceStatus::Offline,
                        })
                        .await;
                }
                report.reaped = reaped;
            }
            Err(e) => warn!(error = %e, "presence reap failed"),
        }

        if report.evicted > 0 || !report.reaped.is_empty() {
            info!(
                probed = report.probed,
                evicted = report.evicted,
                reaped = report.reaped.len(),
                "sweep finished"
            );
        }
        report
    }

    /// Run [`sweep`](Self::sweep) every `interval` until `cancel` fires.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // Skip the immediate first tick
            let _ = ticker.tick().await;
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let _ = registry.sweep().await;
                    }
                }
            }
            debug!("sweeper stopped");
        })
    }

    /// Every user online on any process.
    ///
    /// Falls back to this process's users if the presence set is unreachable.
    pub async fn online_users(&self) -> Vec<UserId> {
        match self.presence.members().await {
            Ok(users) => users,
            Err(e) => {
                warn!(error = %e, "presence read failed, reporting local users only");
                self.local_users().await
            }
        }
    }

    /// Users with a connection on this process, sorted.
    pub async fn local_users(&self) -> Vec<UserId> {
        let mut users: Vec<UserId> = self.inner.lock().await.entries.keys().copied().collect();
        users.sort_unstable();
        users
    }

    /// Number of local connections.
    pub async fn count(&self) -> usize {
        self.inner.lock().await.count
    }

    /// The registered handle for `user`.
    pub async fn get(&self, user: UserId) -> Option<Arc<ConnectionHandle>> {
        self.inner.lock().await.entries.get(&user).cloned()
    }

    /// Close every local connection (process shutdown).
    pub async fn close_all(&self) {
        for handle in self.handles().await {
            let _ = self.evict(&handle).await;
        }
    }

    async fn handles(&self) -> Vec<Arc<ConnectionHandle>> {
        self.inner.lock().await.entries.values().cloned().collect()
    }
}

#[allow(clippy::cast_precision_loss)]
fn count_f64(n: usize) -> f64 {
    n as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use parking_lot::Mutex as SyncMutex;
    use proptest::prelude::*;
    use relay_store::MemoryPresence;

    #[derive(Default)]
    struct Recorder {
        events: SyncMutex<Vec<(UserId, PresenceStatus)>>,
    }

    #[async_trait]
    impl StatusNotifier for Recorder {
        async fn user_status(&self, status: UserStatus) {
            self.events.lock().push((status.user_id, status.status));
        }
    }

    impl Recorder {
        fn offline_count(&self, user: UserId) -> usize {
            self.events
                .lock()
                .iter()
                .filter(|(u, s)| *u == user && *s == PresenceStatus::Offline)
                .count()
        }
    }

    struct Fixture {
        registry: ConnectionRegistry,
        presence: Arc<MemoryPresence>,
        recorder: Arc<Recorder>,
    }

    fn fixture(cap: usize, queue: usize) -> Fixture {
        let presence = Arc::new(MemoryPresence::new());
        let recorder = Arc::new(Recorder::default());
        let config = RegistryConfig {
            max_connections: cap,
            send_queue_capacity: queue,
            ..RegistryConfig::default()
        };
        let registry = ConnectionRegistry::new(config, "node-a", presence.clone(), recorder.clone());
        Fixture {
            registry,
            presence,
            recorder,
        }
    }

    fn identity(id: u64) -> Identity {
        Identity {
            user_id: UserId(id),
            display_name: format!("user{id}"),
        }
    }

    fn frame(s: &str) -> Frame {
        Arc::from(s)
    }

    #[tokio::test]
    async fn admit_registers_and_marks_presence() {
        let f = fixture(10, 4);
        let a = f.registry.admit(&identity(1)).await.unwrap();
        assert!(!a.replaced);
        assert_eq!(f.registry.count().await, 1);
        assert_eq!(f.presence.owner(UserId(1)).as_deref(), Some("node-a"));
        assert_eq!(
            f.recorder.events.lock().as_slice(),
            &[(UserId(1), PresenceStatus::Online)]
        );
    }

    #[tokio::test]
    async fn readmit_replaces_exactly_one_handle() {
        let f = fixture(10, 4);
        let first = f.registry.admit(&identity(1)).await.unwrap();
        let second = f.registry.admit(&identity(1)).await.unwrap();
        assert!(second.replaced);
        assert!(first.handle.is_closed());
        assert_eq!(f.registry.count().await, 1);
        let current = f.registry.get(UserId(1)).await.unwrap();
        assert!(Arc::ptr_eq(&current, &second.handle));
    }

    #[tokio::test]
    async fn stale_evict_keeps_newer_connection() {
        let f = fixture(10, 4);
        let old = f.registry.admit(&identity(1)).await.unwrap();
        let new = f.registry.admit(&identity(1)).await.unwrap();
        assert!(!f.registry.evict(&old.handle).await);
        assert_eq!(f.registry.count().await, 1);
        assert!(!new.handle.is_closed());
        assert_eq!(f.recorder.offline_count(UserId(1)), 0);
        assert!(f.presence.owner(UserId(1)).is_some());
    }

    #[tokio::test]
    async fn evict_removes_presence_and_publishes_offline() {
        let f = fixture(10, 4);
        let a = f.registry.admit(&identity(1)).await.unwrap();
        assert!(f.registry.evict(&a.handle).await);
        assert!(!f.registry.evict(&a.handle).await);
        assert_eq!(f.registry.count().await, 0);
        assert!(f.presence.owner(UserId(1)).is_none());
        assert_eq!(f.recorder.offline_count(UserId(1)), 1);
    }

    #[tokio::test]
    async fn cap_refuses_new_identity_and_keeps_existing() {
        let f = fixture(1, 4);
        let first = f.registry.admit(&identity(1)).await.unwrap();
        let err = f.registry.admit(&identity(2)).await.err().unwrap();
        assert_matches!(err, RelayError::ConnectionSaturated { cap: 1 });
        assert!(!first.handle.is_closed());
        assert_eq!(f.registry.local_users().await, vec![UserId(1)]);
    }

    #[tokio::test]
    async fn deliver_to_absent_user_is_false_and_harmless() {
        let f = fixture(10, 4);
        let _a = f.registry.admit(&identity(1)).await.unwrap();
        assert!(!f.registry.deliver(UserId(9), frame("x")).await);
        assert_eq!(f.registry.count().await, 1);
        assert_eq!(f.recorder.events.lock().len(), 1);
    }

    #[tokio::test]
    async fn deliver_reaches_outbound_queue_in_order() {
        let f = fixture(10, 4);
        let mut a = f.registry.admit(&identity(1)).await.unwrap();
        for text in ["one", "two", "three", "four"] {
            assert!(f.registry.deliver(UserId(1), frame(text)).await);
        }
        for text in ["one", "two", "three", "four"] {
            assert_eq!(&*a.outbound.recv().await.unwrap(), text);
        }
    }

    #[tokio::test]
    async fn full_queue_evicts_once() {
        let f = fixture(10, 1);
        let a = f.registry.admit(&identity(1)).await.unwrap();
        assert!(f.registry.deliver(UserId(1), frame("fills")).await);
        assert!(!f.registry.deliver(UserId(1), frame("overflows")).await);
        assert!(!f.registry.deliver(UserId(1), frame("after")).await);
        assert!(a.handle.is_closed());
        assert_eq!(f.registry.count().await, 0);
        assert_eq!(f.recorder.offline_count(UserId(1)), 1);
    }

    #[tokio::test]
    async fn broadcast_skips_full_queues_without_evicting() {
        let f = fixture(10, 1);
        let mut a = f.registry.admit(&identity(1)).await.unwrap();
        let b = f.registry.admit(&identity(2)).await.unwrap();
        assert!(f.registry.deliver(UserId(2), frame("fills")).await);
        assert_eq!(f.registry.broadcast(frame("all")).await, 1);
        assert_eq!(&*a.outbound.recv().await.unwrap(), "all");
        assert!(!b.handle.is_closed());
        assert_eq!(f.registry.count().await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_evicts_silent_connections_and_reaps_dead_nodes() {
        let f = fixture(10, 4);
        let quiet = f.registry.admit(&identity(1)).await.unwrap();
        let chatty = f.registry.admit(&identity(2)).await.unwrap();
        f.presence.mark_online(UserId(99), "crashed-node").await.unwrap();

        tokio::time::advance(Duration::from_secs(61)).await;
        chatty.handle.mark_alive();

        let report = f.registry.sweep().await;
        assert_eq!(report.probed, 2);
        assert_eq!(report.evicted, 1);
        assert!(quiet.handle.is_closed());
        assert_eq!(f.registry.local_users().await, vec![UserId(2)]);
        // Leases use wall-clock time, so nothing is old enough to reap yet.
        assert!(report.reaped.is_empty());
        assert_eq!(f.registry.online_users().await, vec![UserId(2), UserId(99)]);
    }

    #[tokio::test]
    async fn sweep_reaps_expired_leases() {
        let presence = Arc::new(MemoryPresence::new());
        let recorder = Arc::new(Recorder::default());
        let config = RegistryConfig {
            presence_stale_after: Duration::ZERO,
            ..RegistryConfig::default()
        };
        let registry = ConnectionRegistry::new(config, "node-a", presence.clone(), recorder.clone());
        presence.mark_online(UserId(99), "crashed-node").await.unwrap();
        let report = registry.sweep().await;
        assert!(report.reaped.contains(&UserId(99)));
        assert_eq!(recorder.offline_count(UserId(99)), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_stops_on_cancel() {
        let f = fixture(10, 4);
        let registry = Arc::new(f.registry);
        let cancel = CancellationToken::new();
        let task = registry.spawn_sweeper(Duration::from_secs(1), cancel.clone());
        tokio::time::advance(Duration::from_secs(3)).await;
        cancel.cancel();
        task.await.unwrap();
    }

    #[derive(Clone, Debug)]
    enum Op {
        Admit(u64),
        EvictCurrent(u64),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (1u64..6).prop_map(Op::Admit),
            (1u64..6).prop_map(Op::EvictCurrent),
        ]
    }

    proptest! {
        #[test]
        fn count_matches_entries_and_never_exceeds_cap(ops in proptest::collection::vec(op(), 1..40), cap in 1usize..5) {
            let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            rt.block_on(async {
                let f = fixture(cap, 4);
                let mut live: Vec<Admission> = Vec::new();
                for op in ops {
                    match op {
                        Op::Admit(id) => {
                            if let Ok(a) = f.registry.admit(&identity(id)).await {
                                live.push(a);
                            }
                        }
                        Op::EvictCurrent(id) => {
                            if let Some(h) = f.registry.get(UserId(id)).await {
                                let _ = f.registry.evict(&h).await;
                            }
                        }
                    }
                    let users = f.registry.local_users().await;
                    let count = f.registry.count().await;
                    prop_assert_eq!(count, users.len());
                    prop_assert!(count <= cap);
                    let open = live.iter().filter(|a| !a.handle.is_closed()).count();
                    prop_assert_eq!(open, count);
                }
                Ok(())
            })?;
        }
    }
}
