//! `rdkafka` transport.
//!
//! Two producers share the cluster connection settings: an idempotent
//! `acks=all` producer for quorum publishes and an `acks=1` producer for
//! best-effort ones. Each subscription gets its own `StreamConsumer`;
//! offsets are stored after the record is handed off and committed by
//! librdkafka's auto-commit.
//!
//! Consumers are assigned every partition of their topic explicitly instead
//! of waiting for a group rebalance. The start position is resolved before
//! `subscribe` returns: the group's committed offset when there is one,
//! otherwise the partition's high watermark, so nothing produced after
//! `subscribe` returns is skipped.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rdkafka::{ClientConfig, Offset, TopicPartitionList};
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::Message;
use rdkafka::producer::{FutureProducer, FutureRecord};
use relay_settings::BrokerSettings;
use tracing::{debug, info};

use crate::error::BrokerError;
use crate::transport::{
    AckLevel, BrokerConsumer, BrokerMessage, BrokerTransport, Delivery, Record, TopicCreation,
    TopicSpec,
};

const METADATA_PROBE_TIMEOUT: Duration = Duration::from_secs(10);
const ASSIGN_TIMEOUT: Duration = Duration::from_secs(10);

fn classify(e: &KafkaError, topic: &str) -> BrokerError {
    match e.rdkafka_error_code() {
        Some(RDKafkaErrorCode::UnknownTopicOrPartition | RDKafkaErrorCode::UnknownTopic) => {
            BrokerError::UnknownTopic(topic.to_string())
        }
        Some(RDKafkaErrorCode::MessageTimedOut | RDKafkaErrorCode::RequestTimedOut) => {
            BrokerError::Timeout(topic.to_string())
        }
        Some(RDKafkaErrorCode::RebalanceInProgress) => BrokerError::Rebalance,
        Some(
            RDKafkaErrorCode::MessageSizeTooLarge
            | RDKafkaErrorCode::InvalidMessage
            | RDKafkaErrorCode::TopicAuthorizationFailed,
        ) => BrokerError::Rejected(e.to_string()),
        _ => BrokerError::Unavailable(e.to_string()),
    }
}

/// [`BrokerTransport`] backed by a Kafka cluster.
pub struct KafkaTransport {
    base: ClientConfig,
    quorum: FutureProducer,
    leader: FutureProducer,
    admin: AdminClient<DefaultClientContext>,
}

impl KafkaTransport {
    /// Build clients and verify the cluster answers a metadata request.
    ///
    /// A failure here means the process cannot do its job; callers should
    /// abort startup.
    pub async fn connect(settings: &BrokerSettings) -> Result<Self, BrokerError> {
        let mut base = ClientConfig::new();
        let _ = base.set("bootstrap.servers", settings.bootstrap_servers.join(","));

        let quorum: FutureProducer = base
            .clone()
            .set("acks", "all")
            .set("enable.idempotence", "true")
            .set("message.timeout.ms", settings.publish_timeout_ms.to_string())
            .create()
            .map_err(|e| BrokerError::Unavailable(format!("create producer: {e}")))?;
        let leader: FutureProducer = base
            .clone()
            .set("acks", "1")
            .set("message.timeout.ms", settings.publish_timeout_ms.to_string())
            .create()
            .map_err(|e| BrokerError::Unavailable(format!("create producer: {e}")))?;
        let admin: AdminClient<DefaultClientContext> = base
            .create()
            .map_err(|e| BrokerError::Unavailable(format!("create admin client: {e}")))?;

        let probe = quorum.clone();
        let brokers = tokio::task::spawn_blocking(move || {
            probe
                .client()
                .fetch_metadata(None, METADATA_PROBE_TIMEOUT)
                .map(|m| m.brokers().len())
        })
        .await
        .map_err(|e| BrokerError::Unavailable(format!("metadata probe task: {e}")))?
        .map_err(|e| BrokerError::Unavailable(format!("metadata probe: {e}")))?;

        info!(
            servers = %settings.bootstrap_servers.join(","),
            brokers,
            "connected to kafka"
        );
        Ok(Self {
            base,
            quorum,
            leader,
            admin,
        })
    }
}

#[async_trait]
impl BrokerTransport for KafkaTransport {
    async fn create_topic(&self, name: &str, spec: &TopicSpec) -> Result<TopicCreation, BrokerError> {
        let retention = spec.retention_ms.to_string();
        let topic = NewTopic::new(name, spec.partitions, TopicReplication::Fixed(spec.replication_factor))
            .set("retention.ms", &retention)
            .set("cleanup.policy", "delete");
        let results = self
            .admin
            .create_topics(&[topic], &AdminOptions::new())
            .await
            .map_err(|e| classify(&e, name))?;
        match results.into_iter().next() {
            Some(Ok(_)) => Ok(TopicCreation::Created),
            Some(Err((_, RDKafkaErrorCode::TopicAlreadyExists))) => Ok(TopicCreation::AlreadyExists),
            Some(Err((_, code))) => Err(BrokerError::Unavailable(format!("create {name}: {code}"))),
            None => Err(BrokerError::Unavailable(format!("create {name}: empty response"))),
        }
    }

    async fn produce(
        &self,
        record: Record,
        ack: AckLevel,
        timeout: Duration,
    ) -> Result<Delivery, BrokerError> {
        let producer = match ack {
            AckLevel::Quorum => &self.quorum,
            AckLevel::Leader => &self.leader,
        };
        let outgoing = FutureRecord::to(&record.topic)
            .key(&record.key)
            .payload(record.payload.as_ref());
        match producer.send(outgoing, timeout).await {
            Ok((partition, offset)) => Ok(Delivery { partition, offset }),
            Err((e, _)) => Err(classify(&e, &record.topic)),
        }
    }

    async fn subscribe(&self, group: &str, topic: &str) -> Result<Box<dyn BrokerConsumer>, BrokerError> {
        let consumer: StreamConsumer = self
            .base
            .clone()
            .set("group.id", group)
            .set("enable.auto.commit", "true")
            .set("enable.auto.offset.store", "false")
            .set("auto.offset.reset", "latest")
            .create()
            .map_err(|e| classify(&e, topic))?;
        let name = topic.to_string();
        let (consumer, partitions) = tokio::task::spawn_blocking(move || {
            let positions = start_positions(&consumer, &name)?;
            consumer.assign(&positions)?;
            Ok::<_, KafkaError>((consumer, positions.count()))
        })
        .await
        .map_err(|e| BrokerError::Unavailable(format!("assign task: {e}")))?
        .map_err(|e| classify(&e, topic))?;
        debug!(topic, group, partitions, "consumer assigned");
        Ok(Box::new(KafkaConsumer {
            consumer,
            topic: topic.to_string(),
        }))
    }
}

/// Where each partition of `topic` should be read from. Blocking.
fn start_positions(consumer: &StreamConsumer, topic: &str) -> Result<TopicPartitionList, KafkaError> {
    let metadata = consumer.fetch_metadata(Some(topic), ASSIGN_TIMEOUT)?;
    let mut wanted = TopicPartitionList::new();
    for partition in metadata
        .topics()
        .iter()
        .filter(|t| t.name() == topic)
        .flat_map(|t| t.partitions())
    {
        let _ = wanted.add_partition(topic, partition.id());
    }
    if wanted.count() == 0 {
        return Err(KafkaError::MetadataFetch(RDKafkaErrorCode::UnknownTopicOrPartition));
    }

    let committed = consumer.committed_offsets(wanted, ASSIGN_TIMEOUT)?;
    let mut positions = TopicPartitionList::new();
    for elem in committed.elements() {
        let offset = match elem.offset() {
            Offset::Offset(n) if n >= 0 => Offset::Offset(n),
            _ => {
                let (_low, high) = consumer.fetch_watermarks(topic, elem.partition(), ASSIGN_TIMEOUT)?;
                Offset::Offset(high)
            }
        };
        positions.add_partition_offset(topic, elem.partition(), offset)?;
    }
    Ok(positions)
}

struct KafkaConsumer {
    consumer: StreamConsumer,
    topic: String,
}

#[async_trait]
impl BrokerConsumer for KafkaConsumer {
    async fn poll(&mut self) -> Result<BrokerMessage, BrokerError> {
        let message = self
            .consumer
            .recv()
            .await
            .map_err(|e| classify(&e, &self.topic))?
            .detach();
        Ok(BrokerMessage {
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
            key: message.key().map(|k| String::from_utf8_lossy(k).into_owned()),
            payload: message.payload().map(Bytes::copy_from_slice).unwrap_or_default(),
        })
    }

    fn commit(&mut self, message: &BrokerMessage) -> Result<(), BrokerError> {
        self.consumer
            .store_offset(&message.topic, message.partition, message.offset + 1)
            .map_err(|e| classify(&e, &message.topic))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn classifies_error_codes() {
        let unknown = KafkaError::MessageProduction(RDKafkaErrorCode::UnknownTopicOrPartition);
        assert_matches!(classify(&unknown, "t"), BrokerError::UnknownTopic(_));

        let timeout = KafkaError::MessageProduction(RDKafkaErrorCode::MessageTimedOut);
        assert_matches!(classify(&timeout, "t"), BrokerError::Timeout(_));

        let too_large = KafkaError::MessageProduction(RDKafkaErrorCode::MessageSizeTooLarge);
        assert_matches!(classify(&too_large, "t"), BrokerError::Rejected(_));

        let down = KafkaError::MessageProduction(RDKafkaErrorCode::AllBrokersDown);
        assert!(classify(&down, "t").is_transient());
    }

    // Integration test requiring a running broker, `RELAY_TEST_KAFKA` or
    // localhost:9092 — run with `cargo test --features kafka -- --ignored`
    #[tokio::test]
    #[ignore]
    async fn record_produced_right_after_subscribe_is_delivered() {
        let settings = BrokerSettings {
            bootstrap_servers: vec![std::env::var("RELAY_TEST_KAFKA").unwrap_or_else(|_| "localhost:9092".into())],
            ..BrokerSettings::default()
        };
        let transport = KafkaTransport::connect(&settings).await.unwrap();
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let topic = format!("relay-it-private-{nanos}");
        let spec = TopicSpec {
            partitions: 2,
            replication_factor: 1,
            retention_ms: 60_000,
        };
        let _ = transport.create_topic(&topic, &spec).await.unwrap();

        let group = format!("relay-it-{nanos}");
        let mut joined = None;
        for _ in 0..40 {
            // Fresh topics take a moment to show up in metadata.
            if let Ok(c) = transport.subscribe(&group, &topic).await {
                joined = Some(c);
                break;
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
        let mut consumer = joined.expect("consumer never joined");
        let record = Record {
            topic: topic.clone(),
            key: "user-1".into(),
            payload: Bytes::from_static(b"first"),
        };
        let _ = transport.produce(record, AckLevel::Quorum, Duration::from_secs(5)).await.unwrap();

        let message = tokio::time::timeout(Duration::from_secs(20), consumer.poll())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.payload, Bytes::from_static(b"first"));
    }
}
