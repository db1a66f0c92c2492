//! Process shutdown: one cancellation token plus the named background tasks
//! (HTTP server, presence sweeper) that must finish before the node stops.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// What [`ShutdownCoordinator::graceful_shutdown`] observed.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Tasks that ended on their own.
    pub finished: Vec<&'static str>,
    /// Tasks still running at the deadline; these were aborted.
    pub aborted: Vec<&'static str>,
}

/// Owns the shutdown token and the tasks waiting on it.
pub struct ShutdownCoordinator {
    token: CancellationToken,
    tasks: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
}

impl ShutdownCoordinator {
    /// Create a coordinator with no tracked tasks.
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Token cancelled when shutdown begins.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Register `handle` under `name`; it is awaited during shutdown.
    pub fn track(&self, name: &'static str, handle: JoinHandle<()>) {
        self.tasks.lock().push((name, handle));
    }

    /// Cancel the token without waiting.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// Whether shutdown has begun.
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Cancel, then give every tracked task until one shared deadline.
    ///
    /// Tasks still running at the deadline are aborted.
    pub async fn graceful_shutdown(&self, timeout: Option<Duration>) -> ShutdownReport {
        let timeout = timeout.unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT);
        let deadline = Instant::now() + timeout;
        self.shutdown();

        let tasks = std::mem::take(&mut *self.tasks.lock());
        info!(tasks = tasks.len(), timeout_ms = timeout.as_millis(), "shutting down");

        let mut report = ShutdownReport::default();
        for (name, mut handle) in tasks {
            if tokio::time::timeout_at(deadline, &mut handle).await.is_ok() {
                report.finished.push(name);
            } else {
                handle.abort();
                warn!(task = name, "task did not stop before the deadline, aborted");
                report.aborted.push(name);
            }
        }
        report
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cooperative_tasks_finish() {
        let coord = ShutdownCoordinator::new();
        let token = coord.token();
        coord.track("server", tokio::spawn(async move { token.cancelled().await }));
        let token = coord.token();
        coord.track("sweeper", tokio::spawn(async move { token.cancelled().await }));

        let report = coord.graceful_shutdown(Some(Duration::from_secs(1))).await;
        assert!(coord.is_shutting_down());
        assert_eq!(report.finished, vec!["server", "sweeper"]);
        assert!(report.aborted.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_task_is_aborted_at_deadline() {
        let coord = ShutdownCoordinator::new();
        let token = coord.token();
        coord.track("server", tokio::spawn(async move { token.cancelled().await }));
        coord.track("stuck", tokio::spawn(std::future::pending::<()>()));

        let report = coord.graceful_shutdown(Some(Duration::from_millis(50))).await;
        assert_eq!(report.finished, vec!["server"]);
        assert_eq!(report.aborted, vec!["stuck"]);
    }

    #[tokio::test]
    async fn second_shutdown_has_nothing_to_wait_for() {
        let coord = ShutdownCoordinator::new();
        coord.shutdown();
        let report = coord.graceful_shutdown(None).await;
        assert_eq!(report, ShutdownReport::default());
    }
}
