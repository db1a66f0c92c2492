//! Relay error taxonomy.
//!
//! Only [`RelayError::PersistenceFailure`], [`RelayError::ConnectionSaturated`]
//! and request-shape errors reach a client. Broker trouble and unresponsive
//! connections are absorbed and observable through logs and metrics.

use thiserror::Error;

use crate::ids::{MessageId, UserId};

/// Errors produced by the fan-out layer.
#[derive(Debug, Error)]
pub enum RelayError {
    /// A topic, publish or subscribe call could not reach the broker.
    ///
    /// `message_id` is set when the event was already persisted, so the
    /// caller still learns the id it was stored under.
    #[error("broker unavailable: {reason}")]
    BrokerUnavailable {
        /// Underlying broker failure.
        reason: String,
        /// Id of the already-persisted event, if any.
        message_id: Option<MessageId>,
    },
    /// The store rejected the chat event; nothing was published.
    #[error("persistence failure: {0}")]
    PersistenceFailure(String),
    /// The registry is at its connection cap.
    #[error("connection limit of {cap} reached")]
    ConnectionSaturated {
        /// Configured cap.
        cap: usize,
    },
    /// The recipient's outbound queue was full and the connection was evicted.
    #[error("connection for user {0} is unresponsive")]
    UnresponsiveConnection(UserId),
    /// A well-formed envelope carried a request that cannot be routed.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// A frame or payload could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),
    /// A payload could not be serialized.
    #[error("encode error: {0}")]
    Encode(#[source] serde_json::Error),
    /// Authentication failed before admission.
    #[error("unauthorized: {0}")]
    Unauthorized(String),
}

impl RelayError {
    /// Stable snake_case code used in `error` envelopes and metric labels.
    pub fn code(&self) -> &'static str {
        match self {
            Self::BrokerUnavailable { .. } => "broker_unavailable",
            Self::PersistenceFailure(_) => "persistence_failure",
            Self::ConnectionSaturated { .. } => "connection_saturated",
            Self::UnresponsiveConnection(_) => "unresponsive_connection",
            Self::InvalidRequest(_) => "invalid_request",
            Self::Decode(_) => "decode_error",
            Self::Encode(_) => "encode_error",
            Self::Unauthorized(_) => "unauthorized",
        }
    }

    /// Whether the error is reported back to the originating client.
    pub fn is_client_visible(&self) -> bool {
        !matches!(
            self,
            Self::BrokerUnavailable { .. } | Self::UnresponsiveConnection(_) | Self::Encode(_)
        )
    }
}
