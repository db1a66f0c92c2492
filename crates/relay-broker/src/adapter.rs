//! The fan-out adapter.
//!
//! One adapter per process. It memoizes created topics and live
//! subscriptions, retries synchronous publishes with jittered backoff, and
//! owns every background task it starts so [`FanoutAdapter::shutdown`] can
//! drain them.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use relay_core::retry::RetryConfig;
use relay_core::topic::{DEFAULT_TOPIC_PREFIX, Topic};
use relay_settings::BrokerSettings;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument, warn};

use crate::error::BrokerError;
use crate::metrics::{BrokerMetrics, MetricsSnapshot};
use crate::subscription::{ConsumeLoop, MessageHandler, SubscriptionHandle, SubscriptionState};
use crate::transport::{AckLevel, BrokerConsumer, BrokerTransport, Delivery, Record, TopicCreation, TopicSpec};

/// Adapter tuning.
#[derive(Clone, Debug)]
pub struct AdapterConfig {
    /// Prepended to every topic name.
    pub topic_prefix: String,
    /// Consumer group shared by all subscriptions of this process.
    pub group_id: String,
    /// Layout of lazily created topics.
    pub topic_spec: TopicSpec,
    /// Deadline for one produce acknowledgement.
    pub publish_timeout: Duration,
    /// Retry policy for [`FanoutAdapter::publish_sync`].
    pub publish_retry: RetryConfig,
    /// Upper bound on consumer-loop backoff.
    pub subscribe_backoff: Duration,
    /// How long [`FanoutAdapter::shutdown`] waits for background tasks.
    pub shutdown_timeout: Duration,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            topic_prefix: DEFAULT_TOPIC_PREFIX.to_string(),
            group_id: "chatroom-group".to_string(),
            topic_spec: TopicSpec::default(),
            publish_timeout: Duration::from_secs(5),
            publish_retry: RetryConfig::default(),
            subscribe_backoff: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl AdapterConfig {
    /// Build from loaded broker settings.
    pub fn from_settings(settings: &BrokerSettings) -> Self {
        Self {
            topic_prefix: settings.topic_prefix.clone(),
            group_id: settings.group_id(),
            topic_spec: TopicSpec {
                partitions: settings.partitions,
                replication_factor: settings.replication_factor,
                retention_ms: settings.retention_ms,
            },
            publish_timeout: settings.publish_timeout(),
            publish_retry: settings.publish_retry.clone(),
            subscribe_backoff: settings.subscribe_backoff(),
            ..Self::default()
        }
    }
}

#[derive(Clone)]
struct Slot {
    handle: SubscriptionHandle,
    /// Flips to `true` once the first join attempt has finished.
    settled: watch::Receiver<bool>,
}

struct Inner {
    transport: Arc<dyn BrokerTransport>,
    config: AdapterConfig,
    known_topics: RwLock<HashSet<String>>,
    subscriptions: Mutex<HashMap<String, Slot>>,
    metrics: Arc<BrokerMetrics>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

/// Publish/subscribe front end over a [`BrokerTransport`].
#[derive(Clone)]
pub struct FanoutAdapter {
    inner: Arc<Inner>,
}

impl FanoutAdapter {
    /// Create an adapter. No broker calls are made until first use.
    pub fn new(transport: Arc<dyn BrokerTransport>, config: AdapterConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                config,
                known_topics: RwLock::new(HashSet::new()),
                subscriptions: Mutex::new(HashMap::new()),
                metrics: Arc::new(BrokerMetrics::default()),
                cancel: CancellationToken::new(),
                tracker: TaskTracker::new(),
            }),
        }
    }

    /// Full broker name of `topic`.
    pub fn topic_name(&self, topic: &Topic) -> String {
        topic.name(&self.inner.config.topic_prefix)
    }

    /// Topic prefix in use.
    pub fn topic_prefix(&self) -> &str {
        &self.inner.config.topic_prefix
    }

    /// Consumer group used by every subscription of this adapter.
    pub fn group_id(&self) -> &str {
        &self.inner.config.group_id
    }

    /// Create `name` if it does not exist yet.
    ///
    /// Success is memoized; a repeat call for a known topic makes no broker
    /// request.
    pub async fn ensure_topic(&self, name: &str) -> Result<(), BrokerError> {
        if self.inner.known_topics.read().contains(name) {
            return Ok(());
        }
        match self
            .inner
            .transport
            .create_topic(name, &self.inner.config.topic_spec)
            .await
        {
            Ok(outcome) => {
                if outcome == TopicCreation::Created {
                    info!(topic = name, partitions = self.inner.config.topic_spec.partitions, "topic created");
                }
                let _ = self.inner.known_topics.write().insert(name.to_string());
                Ok(())
            }
            Err(e) => {
                self.inner.metrics.record_error("ensure_topic");
                warn!(topic = name, error = %e, "ensure topic failed");
                Err(e)
            }
        }
    }

    fn forget_topic(&self, name: &str) {
        let _ = self.inner.known_topics.write().remove(name);
    }

    async fn produce_once(
        &self,
        topic: &str,
        key: &str,
        payload: &Bytes,
        ack: AckLevel,
    ) -> Result<Delivery, BrokerError> {
        self.ensure_topic(topic).await?;
        let record = Record {
            topic: topic.to_string(),
            key: key.to_string(),
            payload: payload.clone(),
        };
        let timeout = self.inner.config.publish_timeout;
        let result = tokio::time::timeout(timeout, self.inner.transport.produce(record, ack, timeout))
            .await
            .unwrap_or_else(|_| Err(BrokerError::Timeout(topic.to_string())));
        if let Err(BrokerError::UnknownTopic(_)) = &result {
            self.forget_topic(topic);
        }
        result
    }

    /// Publish and wait for quorum acknowledgement.
    ///
    /// Transient failures are retried up to `publish_retry.max_retries`
    /// times; the last error is returned once the budget is spent.
    #[instrument(skip(self, payload), fields(bytes = payload.len()))]
    pub async fn publish_sync(&self, topic: &str, key: &str, payload: Bytes) -> Result<Delivery, BrokerError> {
        let retry = &self.inner.config.publish_retry;
        let mut attempt: u32 = 0;
        loop {
            match self.produce_once(topic, key, &payload, AckLevel::Quorum).await {
                Ok(delivery) => {
                    self.inner.metrics.record_sent();
                    debug!(partition = delivery.partition, offset = delivery.offset, "published");
                    return Ok(delivery);
                }
                Err(e) if e.is_transient() && attempt < retry.max_retries => {
                    let delay = retry.delay_for(attempt);
                    attempt += 1;
                    self.inner.metrics.record_retry();
                    debug!(attempt, delay_ms = delay.as_millis(), error = %e, "publish failed, retrying");
                    tokio::select! {
                        () = self.inner.cancel.cancelled() => return Err(e),
                        () = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => {
                    self.inner.metrics.record_error("publish");
                    warn!(attempts = attempt + 1, error = %e, "publish failed");
                    return Err(e);
                }
            }
        }
    }

    /// Publish without waiting. Failures are counted, never reported.
    pub fn publish_async(&self, topic: &str, key: &str, payload: Bytes) {
        if self.inner.cancel.is_cancelled() {
            return;
        }
        let adapter = self.clone();
        let topic = topic.to_string();
        let key = key.to_string();
        let _ = self.inner.tracker.spawn(async move {
            match adapter.produce_once(&topic, &key, &payload, AckLevel::Leader).await {
                Ok(_) => adapter.inner.metrics.record_sent(),
                Err(e) => {
                    adapter.inner.metrics.record_error("publish_async");
                    debug!(topic = %topic, error = %e, "async publish dropped");
                }
            }
        });
    }

    /// Start consuming `topic`, handing each record to `handler`.
    ///
    /// Returns once the consumer has joined, or after the first join attempt
    /// failed (the loop keeps retrying in the background). A topic that is
    /// already subscribed returns the existing handle and ignores `handler`;
    /// a concurrent caller for the same topic waits for that first attempt.
    /// Broker calls run outside the subscription table lock, so a slow topic
    /// never delays subscriptions to other topics.
    pub async fn subscribe(&self, topic: &str, handler: Arc<dyn MessageHandler>) -> SubscriptionHandle {
        let slot = {
            let mut subscriptions = self.inner.subscriptions.lock();
            if let Some(existing) = subscriptions.get(topic) {
                existing.clone()
            } else {
                let slot = self.start_subscription(topic, handler);
                let _ = subscriptions.insert(topic.to_string(), slot.clone());
                slot
            }
        };
        let mut settled = slot.settled;
        let _ = settled.wait_for(|done| *done).await;
        slot.handle
    }

    fn start_subscription(&self, topic: &str, handler: Arc<dyn MessageHandler>) -> Slot {
        let (state_tx, state_rx) = watch::channel(SubscriptionState::Starting);
        let (settled_tx, settled_rx) = watch::channel(false);
        let slot = Slot {
            handle: SubscriptionHandle::new(topic.to_string(), state_rx),
            settled: settled_rx,
        };
        if self.inner.cancel.is_cancelled() {
            let _ = state_tx.send(SubscriptionState::Stopped);
            let _ = settled_tx.send(true);
            return slot;
        }

        let consume = ConsumeLoop {
            transport: Arc::clone(&self.inner.transport),
            group: self.inner.config.group_id.clone(),
            topic: topic.to_string(),
            handler,
            metrics: Arc::clone(&self.inner.metrics),
            state: state_tx,
            cancel: self.inner.cancel.child_token(),
            tracker: self.inner.tracker.clone(),
            max_backoff: self.inner.config.subscribe_backoff,
        };
        let adapter = self.clone();
        let _ = self.inner.tracker.spawn(async move {
            let initial = tokio::select! {
                () = consume.cancel.cancelled() => None,
                joined = adapter.first_join(&consume.topic) => joined,
            };
            if initial.is_some() {
                let _ = consume.state.send(SubscriptionState::Ready);
            }
            let _ = settled_tx.send(true);
            consume.run(initial).await;
        });
        slot
    }

    async fn first_join(&self, topic: &str) -> Option<Box<dyn BrokerConsumer>> {
        self.ensure_topic(topic).await.ok()?;
        match self.inner.transport.subscribe(&self.inner.config.group_id, topic).await {
            Ok(consumer) => {
                info!(topic, group = %self.inner.config.group_id, "subscribed");
                Some(consumer)
            }
            Err(e) => {
                self.inner.metrics.record_error("subscribe");
                warn!(topic, error = %e, "subscribe failed, retrying in background");
                None
            }
        }
    }

    /// Handle of an existing subscription.
    pub fn subscription(&self, topic: &str) -> Option<SubscriptionHandle> {
        self.inner.subscriptions.lock().get(topic).map(|slot| slot.handle.clone())
    }

    /// Run a background task owned by the adapter.
    ///
    /// `task` receives a token cancelled by [`FanoutAdapter::shutdown`],
    /// which then waits for the task like any consumer loop.
    pub fn spawn_tracked<F, Fut>(&self, task: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let _ = self.inner.tracker.spawn(task(self.inner.cancel.child_token()));
    }

    /// Current counters.
    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Stop every subscription and wait for in-flight tasks.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        let _ = self.inner.tracker.close();
        let timeout = self.inner.config.shutdown_timeout;
        if tokio::time::timeout(timeout, self.inner.tracker.wait()).await.is_err() {
            warn!(
                remaining = self.inner.tracker.len(),
                "broker tasks still running after shutdown timeout"
            );
        } else {
            info!("broker adapter stopped");
        }
    }
}
