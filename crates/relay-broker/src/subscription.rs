//! Per-topic consumption loops.
//!
//! Each subscription owns one [`BrokerConsumer`] and runs until the adapter
//! shuts down:
//!
//! ```text
//! starting → ready → consuming ⇄ rebalancing
//!                        │
//!                        └────────→ stopped (shutdown only)
//! ```
//!
//! Every record is handed to the [`MessageHandler`] on its own task and
//! committed right away, whatever the handler does with it.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::error::BrokerError;
use crate::metrics::BrokerMetrics;
use crate::transport::{BrokerConsumer, BrokerMessage, BrokerTransport};

const MIN_BACKOFF: Duration = Duration::from_millis(100);

/// Lifecycle of one subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubscriptionState {
    /// Joining the consumer group.
    Starting,
    /// Joined; nothing received yet.
    Ready,
    /// Receiving records.
    Consuming,
    /// Group membership lost; rejoining.
    Rebalancing,
    /// Terminal; the adapter shut down.
    Stopped,
}

/// Receives every record of a subscribed topic.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    /// Process one record. Panics are caught and counted.
    async fn handle(&self, message: BrokerMessage);
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(BrokerMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn handle(&self, message: BrokerMessage) {
        (self.0)(message).await;
    }
}

/// Wrap an async closure as a [`MessageHandler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(BrokerMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Observer for a running subscription.
#[derive(Clone, Debug)]
pub struct SubscriptionHandle {
    topic: String,
    state: watch::Receiver<SubscriptionState>,
}

impl SubscriptionHandle {
    pub(crate) fn new(topic: String, state: watch::Receiver<SubscriptionState>) -> Self {
        Self { topic, state }
    }

    /// Full topic name.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Current state.
    pub fn state(&self) -> SubscriptionState {
        *self.state.borrow()
    }

    /// Wait until the subscription reaches `target`.
    ///
    /// Returns `false` if the loop ended without reaching it.
    pub async fn wait_for(&self, target: SubscriptionState) -> bool {
        let mut rx = self.state.clone();
        rx.wait_for(|s| *s == target).await.is_ok()
    }
}

pub(crate) struct ConsumeLoop {
    pub transport: Arc<dyn BrokerTransport>,
    pub group: String,
    pub topic: String,
    pub handler: Arc<dyn MessageHandler>,
    pub metrics: Arc<BrokerMetrics>,
    pub state: watch::Sender<SubscriptionState>,
    pub cancel: CancellationToken,
    pub tracker: TaskTracker,
    pub max_backoff: Duration,
}

impl ConsumeLoop {
    pub(crate) async fn run(self, initial: Option<Box<dyn BrokerConsumer>>) {
        let mut consumer = initial;
        let mut joined_once = consumer.is_some();
        let mut failures: u32 = 0;

        loop {
            if consumer.is_none() {
                let joined = tokio::select! {
                    () = self.cancel.cancelled() => break,
                    r = self.transport.subscribe(&self.group, &self.topic) => r,
                };
                match joined {
                    Ok(c) => {
                        info!(topic = %self.topic, group = %self.group, "consumer joined");
                        consumer = Some(c);
                        failures = 0;
                        self.set(if joined_once {
                            SubscriptionState::Consuming
                        } else {
                            SubscriptionState::Ready
                        });
                        joined_once = true;
                    }
                    Err(e) => {
                        self.metrics.record_error("subscribe");
                        warn!(topic = %self.topic, error = %e, "consumer join failed, retrying");
                        if !self.pause(&mut failures).await {
                            break;
                        }
                    }
                }
                continue;
            }
            let Some(active) = consumer.as_mut() else {
                continue;
            };

            let polled = tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                r = active.poll() => r,
            };

            match polled {
                Ok(message) => {
                    failures = 0;
                    self.set(SubscriptionState::Consuming);
                    self.dispatch(message.clone());
                    if let Err(e) = active.commit(&message) {
                        self.metrics.record_error("commit");
                        warn!(topic = %self.topic, offset = message.offset, error = %e, "commit failed");
                    }
                }
                Err(BrokerError::Rebalance) => {
                    info!(topic = %self.topic, "consumer group rebalancing");
                    self.set(SubscriptionState::Rebalancing);
                    consumer = None;
                    if !self.pause(&mut failures).await {
                        break;
                    }
                }
                Err(BrokerError::Closed) => {
                    debug!(topic = %self.topic, "consumer closed, rejoining");
                    consumer = None;
                }
                Err(e) => {
                    self.metrics.record_error("poll");
                    warn!(topic = %self.topic, error = %e, "poll failed, backing off");
                    if !self.pause(&mut failures).await {
                        break;
                    }
                }
            }
        }

        self.set(SubscriptionState::Stopped);
        debug!(topic = %self.topic, "subscription stopped");
    }

    fn set(&self, state: SubscriptionState) {
        let _ = self.state.send_if_modified(|current| {
            let changed = *current != state;
            *current = state;
            changed
        });
    }

    fn dispatch(&self, message: BrokerMessage) {
        let handler = Arc::clone(&self.handler);
        let metrics = Arc::clone(&self.metrics);
        let topic = self.topic.clone();
        let offset = message.offset;
        let _ = self.tracker.spawn(async move {
            match AssertUnwindSafe(handler.handle(message)).catch_unwind().await {
                Ok(()) => metrics.record_received(),
                Err(_) => {
                    metrics.record_panic();
                    error!(topic = %topic, offset, "message handler panicked");
                }
            }
        });
    }

    /// Sleep with exponential backoff. Returns `false` when cancelled.
    async fn pause(&self, failures: &mut u32) -> bool {
        let delay = MIN_BACKOFF
            .saturating_mul(1u32 << (*failures).min(16))
            .min(self.max_backoff);
        *failures = failures.saturating_add(1);
        tokio::select! {
            () = self.cancel.cancelled() => false,
            () = tokio::time::sleep(delay) => true,
        }
    }
}
