//! The seam between the adapter and a concrete broker client.
//!
//! Consumption is pull-based: a [`BrokerConsumer`] is polled in a loop and
//! records are committed explicitly, independent of any client library's
//! callback registration API.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::BrokerError;

/// Acknowledgement level requested for a produce call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AckLevel {
    /// Partition leader only (best effort).
    Leader,
    /// All in-sync replicas.
    Quorum,
}

/// A record to produce.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Record {
    /// Full topic name.
    pub topic: String,
    /// Partition key.
    pub key: String,
    /// Serialized envelope.
    pub payload: Bytes,
}

/// Where an acknowledged record landed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Delivery {
    /// Partition index.
    pub partition: i32,
    /// Offset within the partition.
    pub offset: i64,
}

/// A record received by a consumer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BrokerMessage {
    /// Full topic name.
    pub topic: String,
    /// Partition index.
    pub partition: i32,
    /// Offset within the partition.
    pub offset: i64,
    /// Partition key, if any.
    pub key: Option<String>,
    /// Serialized envelope.
    pub payload: Bytes,
}

/// Layout of lazily created topics.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TopicSpec {
    /// Partition count.
    pub partitions: i32,
    /// Replication factor.
    pub replication_factor: i32,
    /// `retention.ms`.
    pub retention_ms: u64,
}

impl Default for TopicSpec {
    fn default() -> Self {
        Self {
            partitions: 3,
            replication_factor: 2,
            retention_ms: 86_400_000,
        }
    }
}

/// Outcome of a topic creation request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TopicCreation {
    /// The topic was created by this call.
    Created,
    /// The topic already existed.
    AlreadyExists,
}

/// A concrete broker client.
#[async_trait]
pub trait BrokerTransport: Send + Sync + 'static {
    /// Create `name` if absent. Existing topics are not an error.
    async fn create_topic(&self, name: &str, spec: &TopicSpec) -> Result<TopicCreation, BrokerError>;

    /// Produce one record and wait for the requested acknowledgement.
    async fn produce(
        &self,
        record: Record,
        ack: AckLevel,
        timeout: Duration,
    ) -> Result<Delivery, BrokerError>;

    /// Join consumer `group` on `topic`.
    ///
    /// The returned consumer's position is fixed when this call returns:
    /// records produced afterwards are observed.
    async fn subscribe(&self, group: &str, topic: &str) -> Result<Box<dyn BrokerConsumer>, BrokerError>;
}

/// One consumer-group member bound to one topic.
#[async_trait]
pub trait BrokerConsumer: Send {
    /// Wait for the next record.
    async fn poll(&mut self) -> Result<BrokerMessage, BrokerError>;

    /// Mark `message` as processed for the group.
    fn commit(&mut self, message: &BrokerMessage) -> Result<(), BrokerError>;
}
