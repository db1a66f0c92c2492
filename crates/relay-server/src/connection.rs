//! A single live client connection as seen by the registry.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use relay_core::ids::UserId;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// One serialized envelope, shared between every queue it is fanned out to.
pub type Frame = Arc<str>;

/// Result of [`ConnectionHandle::try_enqueue`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// The frame is in the outbound queue.
    Queued,
    /// The queue is at capacity.
    Full,
    /// The queue was closed.
    Closed,
}

/// Owner of a connection's bounded outbound queue.
///
/// The queue has exactly one producer side, held here. [`close`] drops it, so
/// the outbound path drains what is already queued and then observes the end
/// of the queue.
///
/// [`close`]: ConnectionHandle::close
pub struct ConnectionHandle {
    id: String,
    user_id: UserId,
    display_name: String,
    tx: Mutex<Option<mpsc::Sender<Frame>>>,
    closed: CancellationToken,
    connected_at: Instant,
    last_activity: Mutex<Instant>,
    dropped: AtomicU64,
}

impl ConnectionHandle {
    /// Create a handle and the receiving end of its outbound queue.
    pub fn new(
        user_id: UserId,
        display_name: impl Into<String>,
        capacity: usize,
    ) -> (Arc<Self>, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let now = Instant::now();
        let handle = Arc::new(Self {
            id: uuid::Uuid::now_v7().to_string(),
            user_id,
            display_name: display_name.into(),
            tx: Mutex::new(Some(tx)),
            closed: CancellationToken::new(),
            connected_at: now,
            last_activity: Mutex::new(now),
            dropped: AtomicU64::new(0),
        });
        (handle, rx)
    }

    /// Unique connection id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Authenticated user.
    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    /// Display name from authentication.
    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    /// Enqueue without waiting.
    pub fn try_enqueue(&self, frame: Frame) -> EnqueueOutcome {
        let guard = self.tx.lock();
        let Some(tx) = guard.as_ref() else {
            return EnqueueOutcome::Closed;
        };
        match tx.try_send(frame) {
            Ok(()) => EnqueueOutcome::Queued,
            Err(TrySendError::Full(_)) => {
                let _ = self.dropped.fetch_add(1, Ordering::Relaxed);
                EnqueueOutcome::Full
            }
            Err(TrySendError::Closed(_)) => EnqueueOutcome::Closed,
        }
    }

    /// Close the outbound queue. Returns `true` on the first call only.
    pub fn close(&self) -> bool {
        let sender = self.tx.lock().take();
        self.closed.cancel();
        sender.is_some()
    }

    /// Whether [`close`](Self::close) was called.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the handle is closed.
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }

    /// Record inbound activity (a frame, ping or pong).
    pub fn mark_alive(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    /// Time since the last inbound activity.
    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    /// Liveness probe used by the sweeper.
    ///
    /// Fails when the handle is closed, the outbound path has gone away, or
    /// nothing arrived from the client within `max_silence`.
    pub fn probe(&self, max_silence: Duration) -> bool {
        let outbound_alive = self.tx.lock().as_ref().is_some_and(|tx| !tx.is_closed());
        outbound_alive && self.idle_for() < max_silence
    }

    /// Frames refused because the queue was full.
    pub fn drop_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Connection age.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
