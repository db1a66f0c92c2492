//! Adapter counters.
//!
//! Counts are kept locally for [`FanoutAdapter::metrics_snapshot`] and
//! mirrored to the global `metrics` recorder for `/metrics`.
//!
//! [`FanoutAdapter::metrics_snapshot`]: crate::FanoutAdapter::metrics_snapshot

use std::sync::atomic::{AtomicU64, Ordering};

use metrics::counter;
use serde::Serialize;

/// Records acknowledged by the broker (counter).
pub const BROKER_MESSAGES_SENT_TOTAL: &str = "broker_messages_sent_total";
/// Records handed to a subscription handler (counter).
pub const BROKER_MESSAGES_RECEIVED_TOTAL: &str = "broker_messages_received_total";
/// Failed publishes, topic creations, polls and handler runs (counter, labels: op).
pub const BROKER_ERRORS_TOTAL: &str = "broker_errors_total";
/// Publish attempts repeated after a transient failure (counter).
pub const BROKER_PUBLISH_RETRIES_TOTAL: &str = "broker_publish_retries_total";
/// Handler invocations that panicked (counter).
pub const BROKER_HANDLER_PANICS_TOTAL: &str = "broker_handler_panics_total";

/// Point-in-time adapter counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    /// Records acknowledged by the broker.
    pub messages_sent: u64,
    /// Records handed to handlers without panicking.
    pub messages_received: u64,
    /// Failures of any kind.
    pub errors: u64,
}

/// Monotonic adapter counters.
#[derive(Debug, Default)]
pub struct BrokerMetrics {
    sent: AtomicU64,
    received: AtomicU64,
    errors: AtomicU64,
}

impl BrokerMetrics {
    pub(crate) fn record_sent(&self) {
        let _ = self.sent.fetch_add(1, Ordering::Relaxed);
        counter!(BROKER_MESSAGES_SENT_TOTAL).increment(1);
    }

    pub(crate) fn record_received(&self) {
        let _ = self.received.fetch_add(1, Ordering::Relaxed);
        counter!(BROKER_MESSAGES_RECEIVED_TOTAL).increment(1);
    }

    pub(crate) fn record_error(&self, op: &'static str) {
        let _ = self.errors.fetch_add(1, Ordering::Relaxed);
        counter!(BROKER_ERRORS_TOTAL, "op" => op).increment(1);
    }

    pub(crate) fn record_retry(&self) {
        counter!(BROKER_PUBLISH_RETRIES_TOTAL).increment(1);
    }

    pub(crate) fn record_panic(&self) {
        self.record_error("handler");
        counter!(BROKER_HANDLER_PANICS_TOTAL).increment(1);
    }

    /// Current values.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            messages_sent: self.sent.load(Ordering::Relaxed),
            messages_received: self.received.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}
