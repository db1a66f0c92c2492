//! Broker error types.

use relay_core::RelayError;
use thiserror::Error;

/// Failures reported by a [`BrokerTransport`](crate::BrokerTransport).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    /// The broker could not be reached.
    #[error("broker unreachable: {0}")]
    Unavailable(String),
    /// No acknowledgement arrived within the deadline.
    #[error("timed out waiting for acknowledgement on {0}")]
    Timeout(String),
    /// The consumer group is rebalancing; poll again.
    #[error("consumer group rebalancing")]
    Rebalance,
    /// The topic does not exist (yet).
    #[error("unknown topic {0}")]
    UnknownTopic(String),
    /// The consumer was closed and must be re-created.
    #[error("consumer closed")]
    Closed,
    /// The broker refused the request; retrying will not help.
    #[error("broker rejected request: {0}")]
    Rejected(String),
}

impl BrokerError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Unavailable(_) | Self::Timeout(_) | Self::Rebalance | Self::UnknownTopic(_)
        )
    }
}

impl From<BrokerError> for RelayError {
    fn from(e: BrokerError) -> Self {
        RelayError::BrokerUnavailable {
            reason: e.to_string(),
            message_id: None,
        }
    }
}
