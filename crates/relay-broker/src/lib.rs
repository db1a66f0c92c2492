//! # relay-broker
//!
//! The broker fan-out adapter. A [`FanoutAdapter`] wraps any
//! [`BrokerTransport`] and provides:
//!
//! - lazy, memoized topic creation ([`FanoutAdapter::ensure_topic`])
//! - quorum-acknowledged publishes with bounded retry ([`FanoutAdapter::publish_sync`])
//! - fire-and-forget publishes ([`FanoutAdapter::publish_async`])
//! - pull-based consumer-group subscriptions that hand each record to an
//!   injected [`MessageHandler`] on its own task ([`FanoutAdapter::subscribe`])
//!
//! Transports: [`MemoryBroker`] (in-process, with fault injection) and, with
//! the `kafka` feature, `KafkaTransport` on top of `rdkafka`.

#![deny(unsafe_code)]

pub mod adapter;
pub mod error;
#[cfg(feature = "kafka")]
pub mod kafka;
pub mod memory;
pub mod metrics;
pub mod subscription;
pub mod transport;

pub use adapter::{AdapterConfig, FanoutAdapter};
pub use error::BrokerError;
#[cfg(feature = "kafka")]
pub use kafka::KafkaTransport;
pub use memory::MemoryBroker;
pub use metrics::{BrokerMetrics, MetricsSnapshot};
pub use subscription::{MessageHandler, SubscriptionHandle, SubscriptionState, handler_fn};
pub use transport::{
    AckLevel, BrokerConsumer, BrokerMessage, BrokerTransport, Delivery, Record, TopicCreation,
    TopicSpec,
};
