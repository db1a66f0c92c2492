//! In-process broker.
//!
//! Each topic is one ordered log; the partition reported for a record is
//! derived from its key. Consumer groups track a committed offset and a read
//! position per topic. A group that joins for the first time starts at the
//! end of the log, matching `auto.offset.reset=latest`.
//!
//! Offsets are absolute. Records older than the topic's `retention_ms` are
//! dropped from the head of the log on each append; a group whose position
//! fell behind the retained head resumes at the oldest retained record.
//!
//! Fault injection (`set_available`, `fail_next_produces`,
//! `trigger_rebalance`) drives the adapter's retry and recovery paths in
//! tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::BrokerError;
use crate::transport::{
    AckLevel, BrokerConsumer, BrokerMessage, BrokerTransport, Delivery, Record, TopicCreation,
    TopicSpec,
};

struct TopicLog {
    partitions: i32,
    retention: Duration,
    /// Offset of the first retained record.
    base: i64,
    records: VecDeque<(Instant, BrokerMessage)>,
}

impl TopicLog {
    fn end(&self) -> i64 {
        self.base + i64::try_from(self.records.len()).unwrap_or(i64::MAX)
    }

    fn trim(&mut self, now: Instant) {
        while let Some((appended, _)) = self.records.front() {
            if now.saturating_duration_since(*appended) < self.retention {
                break;
            }
            let _ = self.records.pop_front();
            self.base += 1;
        }
    }

    fn get(&self, offset: i64) -> Option<&BrokerMessage> {
        let index = usize::try_from(offset.max(self.base) - self.base).ok()?;
        self.records.get(index).map(|(_, record)| record)
    }
}

struct GroupCursor {
    next: i64,
    committed: i64,
    generation: u64,
}

#[derive(Default)]
struct State {
    topics: HashMap<String, TopicLog>,
    groups: HashMap<(String, String), GroupCursor>,
}

struct Shared {
    state: Mutex<State>,
    appended: Notify,
    available: AtomicBool,
    fail_produces: AtomicUsize,
    create_calls: AtomicUsize,
}

/// [`BrokerTransport`] held in process memory.
///
/// Clones share one broker, so several relay nodes in one test observe the
/// same topics.
#[derive(Clone)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    /// Create an empty, reachable broker.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                appended: Notify::new(),
                available: AtomicBool::new(true),
                fail_produces: AtomicUsize::new(0),
                create_calls: AtomicUsize::new(0),
            }),
        }
    }

    /// Make every call fail with [`BrokerError::Unavailable`] while `false`.
    pub fn set_available(&self, available: bool) {
        self.shared.available.store(available, Ordering::SeqCst);
        self.shared.appended.notify_waiters();
    }

    /// Fail the next `n` produce calls with a transient error.
    pub fn fail_next_produces(&self, n: usize) {
        self.shared.fail_produces.store(n, Ordering::SeqCst);
    }

    /// Force every member of every group on `topic` to rejoin.
    pub fn trigger_rebalance(&self, topic: &str) {
        {
            let mut state = self.shared.state.lock();
            for ((_, t), cursor) in &mut state.groups {
                if t == topic {
                    cursor.generation += 1;
                }
            }
        }
        self.shared.appended.notify_waiters();
    }

    /// Every retained record of `topic`.
    pub fn records(&self, topic: &str) -> Vec<BrokerMessage> {
        self.shared
            .state
            .lock()
            .topics
            .get(topic)
            .map(|log| log.records.iter().map(|(_, record)| record.clone()).collect())
            .unwrap_or_default()
    }

    /// Committed position of `group` on `topic` (next offset to read).
    pub fn committed_offset(&self, group: &str, topic: &str) -> Option<i64> {
        self.shared
            .state
            .lock()
            .groups
            .get(&(group.to_string(), topic.to_string()))
            .map(|c| c.committed)
    }

    /// Names of all created topics, sorted.
    pub fn topic_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.shared.state.lock().topics.keys().cloned().collect();
        names.sort();
        names
    }

    /// How many times `create_topic` reached the broker.
    pub fn create_topic_calls(&self) -> usize {
        self.shared.create_calls.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> Result<(), BrokerError> {
        if self.shared.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BrokerError::Unavailable("memory broker offline".into()))
        }
    }
}

fn partition_for(key: &str, partitions: i32) -> i32 {
    let hash = key
        .bytes()
        .fold(0x811c_9dc5_u32, |h, b| (h ^ u32::from(b)).wrapping_mul(0x0100_0193));
    let n = u32::try_from(partitions.max(1)).unwrap_or(1);
    i32::try_from(hash % n).unwrap_or(0)
}

#[async_trait]
impl BrokerTransport for MemoryBroker {
    async fn create_topic(&self, name: &str, spec: &TopicSpec) -> Result<TopicCreation, BrokerError> {
        self.check_available()?;
        let _ = self.shared.create_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.shared.state.lock();
        if state.topics.contains_key(name) {
            return Ok(TopicCreation::AlreadyExists);
        }
        let _ = state.topics.insert(
            name.to_string(),
            TopicLog {
                partitions: spec.partitions,
                retention: Duration::from_millis(spec.retention_ms),
                base: 0,
                records: VecDeque::new(),
            },
        );
        Ok(TopicCreation::Created)
    }

    async fn produce(
        &self,
        record: Record,
        _ack: AckLevel,
        _timeout: Duration,
    ) -> Result<Delivery, BrokerError> {
        self.check_available()?;
        let injected = self
            .shared
            .fail_produces
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(BrokerError::Timeout(record.topic));
        }

        let delivery = {
            let mut state = self.shared.state.lock();
            let log = state
                .topics
                .get_mut(&record.topic)
                .ok_or_else(|| BrokerError::UnknownTopic(record.topic.clone()))?;
            let now = Instant::now();
            log.trim(now);
            let partition = partition_for(&record.key, log.partitions);
            let offset = log.end();
            log.records.push_back((
                now,
                BrokerMessage {
                    topic: record.topic,
                    partition,
                    offset,
                    key: Some(record.key),
                    payload: record.payload,
                },
            ));
            Delivery { partition, offset }
        };
        self.shared.appended.notify_waiters();
        Ok(delivery)
    }

    async fn subscribe(&self, group: &str, topic: &str) -> Result<Box<dyn BrokerConsumer>, BrokerError> {
        self.check_available()?;
        let mut state = self.shared.state.lock();
        let end = state
            .topics
            .get(topic)
            .map(TopicLog::end)
            .ok_or_else(|| BrokerError::UnknownTopic(topic.to_string()))?;
        let cursor = state
            .groups
            .entry((group.to_string(), topic.to_string()))
            .or_insert(GroupCursor {
                next: end,
                committed: end,
                generation: 0,
            });
        cursor.next = cursor.committed;
        let generation = cursor.generation;
        Ok(Box::new(MemoryConsumer {
            broker: self.clone(),
            group: group.to_string(),
            topic: topic.to_string(),
            generation,
        }))
    }
}

struct MemoryConsumer {
    broker: MemoryBroker,
    group: String,
    topic: String,
    generation: u64,
}

impl MemoryConsumer {
    fn try_next(&self) -> Result<Option<BrokerMessage>, BrokerError> {
        self.broker.check_available()?;
        let mut guard = self.broker.shared.state.lock();
        let state = &mut *guard;
        let cursor = state
            .groups
            .get_mut(&(self.group.clone(), self.topic.clone()))
            .ok_or(BrokerError::Closed)?;
        if cursor.generation != self.generation {
            return Err(BrokerError::Rebalance);
        }
        let log = state
            .topics
            .get(&self.topic)
            .ok_or_else(|| BrokerError::UnknownTopic(self.topic.clone()))?;
        match log.get(cursor.next) {
            Some(record) => {
                cursor.next = record.offset + 1;
                Ok(Some(record.clone()))
            }
            None => Ok(None),
        }
    }
}

#[async_trait]
impl BrokerConsumer for MemoryConsumer {
    async fn poll(&mut self) -> Result<BrokerMessage, BrokerError> {
        let shared = Arc::clone(&self.broker.shared);
        loop {
            let notified = shared.appended.notified();
            tokio::pin!(notified);
            let _ = notified.as_mut().enable();
            if let Some(message) = self.try_next()? {
                return Ok(message);
            }
            notified.await;
        }
    }

    fn commit(&mut self, message: &BrokerMessage) -> Result<(), BrokerError> {
        if message.offset < 0 {
            return Err(BrokerError::Rejected(format!("bad offset {}", message.offset)));
        }
        let position = message.offset + 1;
        let mut state = self.broker.shared.state.lock();
        if let Some(cursor) = state
            .groups
            .get_mut(&(self.group.clone(), self.topic.clone()))
            .filter(|c| c.generation == self.generation)
        {
            cursor.committed = cursor.committed.max(position);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use bytes::Bytes;

    const T: &str = "chatroom-private-1";

    fn record(payload: &'static str) -> Record {
        Record {
            topic: T.into(),
            key: "user-1".into(),
            payload: Bytes::from_static(payload.as_bytes()),
        }
    }

    async fn broker_with_topic() -> MemoryBroker {
        let b = MemoryBroker::new();
        let _ = b.create_topic(T, &TopicSpec::default()).await.unwrap();
        b
    }

    #[tokio::test]
    async fn create_topic_is_idempotent() {
        let b = MemoryBroker::new();
        assert_eq!(b.create_topic(T, &TopicSpec::default()).await.unwrap(), TopicCreation::Created);
        assert_eq!(
            b.create_topic(T, &TopicSpec::default()).await.unwrap(),
            TopicCreation::AlreadyExists
        );
        assert_eq!(b.topic_names(), vec![T.to_string()]);
        assert_eq!(b.create_topic_calls(), 2);
    }

    #[tokio::test]
    async fn produce_to_unknown_topic_fails() {
        let b = MemoryBroker::new();
        let err = b
            .produce(record("x"), AckLevel::Quorum, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_matches!(err, BrokerError::UnknownTopic(_));
    }

    #[tokio::test]
    async fn new_group_starts_at_log_end() {
        let b = broker_with_topic().await;
        let _ = b.produce(record("before"), AckLevel::Quorum, Duration::from_secs(1)).await.unwrap();
        let mut c = b.subscribe("g", T).await.unwrap();
        let _ = b.produce(record("after"), AckLevel::Quorum, Duration::from_secs(1)).await.unwrap();
        let msg = c.poll().await.unwrap();
        assert_eq!(msg.payload, Bytes::from_static(b"after"));
        assert_eq!(msg.offset, 1);
    }

    #[tokio::test]
    async fn poll_wakes_on_append() {
        let b = broker_with_topic().await;
        let mut c = b.subscribe("g", T).await.unwrap();
        let producer = b.clone();
        let task = tokio::spawn(async move { c.poll().await });
        tokio::task::yield_now().await;
        let _ = producer.produce(record("late"), AckLevel::Leader, Duration::from_secs(1)).await.unwrap();
        let msg = task.await.unwrap().unwrap();
        assert_eq!(msg.payload, Bytes::from_static(b"late"));
    }

    #[tokio::test]
    async fn separate_groups_each_see_every_record() {
        let b = broker_with_topic().await;
        let mut a = b.subscribe("chatroom-group-a", T).await.unwrap();
        let mut z = b.subscribe("chatroom-group-z", T).await.unwrap();
        let _ = b.produce(record("one"), AckLevel::Quorum, Duration::from_secs(1)).await.unwrap();
        assert_eq!(a.poll().await.unwrap().offset, 0);
        assert_eq!(z.poll().await.unwrap().offset, 0);
    }

    #[tokio::test]
    async fn rebalance_resumes_from_commit() {
        let b = broker_with_topic().await;
        let mut c = b.subscribe("g", T).await.unwrap();
        for p in ["a", "b"] {
            let _ = b.produce(record(p), AckLevel::Quorum, Duration::from_secs(1)).await.unwrap();
        }
        let first = c.poll().await.unwrap();
        c.commit(&first).unwrap();
        let _uncommitted = c.poll().await.unwrap();

        b.trigger_rebalance(T);
        assert_matches!(c.poll().await, Err(BrokerError::Rebalance));

        let mut rejoined = b.subscribe("g", T).await.unwrap();
        assert_eq!(rejoined.poll().await.unwrap().payload, Bytes::from_static(b"b"));
        assert_eq!(b.committed_offset("g", T), Some(1));
    }

    #[tokio::test]
    async fn injected_failures_and_outage() {
        let b = broker_with_topic().await;
        b.fail_next_produces(1);
        assert_matches!(
            b.produce(record("x"), AckLevel::Quorum, Duration::from_secs(1)).await,
            Err(BrokerError::Timeout(_))
        );
        assert!(b.produce(record("x"), AckLevel::Quorum, Duration::from_secs(1)).await.is_ok());

        b.set_available(false);
        assert!(matches!(b.subscribe("g", T).await, Err(BrokerError::Unavailable(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_records_are_dropped_and_offsets_stay_absolute() {
        let b = MemoryBroker::new();
        let spec = TopicSpec {
            retention_ms: 1_000,
            ..TopicSpec::default()
        };
        let _ = b.create_topic(T, &spec).await.unwrap();
        let mut lagging = b.subscribe("g", T).await.unwrap();

        for p in ["a", "b"] {
            let _ = b.produce(record(p), AckLevel::Quorum, Duration::from_secs(1)).await.unwrap();
        }
        tokio::time::advance(Duration::from_millis(1_500)).await;
        let delivery = b.produce(record("c"), AckLevel::Quorum, Duration::from_secs(1)).await.unwrap();
        assert_eq!(delivery.offset, 2);

        let kept = b.records(T);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].offset, 2);

        let msg = lagging.poll().await.unwrap();
        assert_eq!(msg.payload, Bytes::from_static(b"c"));
        lagging.commit(&msg).unwrap();
        assert_eq!(b.committed_offset("g", T), Some(3));
    }

    #[test]
    fn partition_is_stable_per_key() {
        let p = partition_for("user-42", 3);
        assert_eq!(p, partition_for("user-42", 3));
        assert!((0..3).contains(&p));
        assert_eq!(partition_for("global", 1), 0);
    }
}
