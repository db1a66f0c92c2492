//! The typed wrapper carried over both the client wire and the broker.
//!
//! ```json
//! {"type": "chat_message", "content": {...}, "timestamp": "2026-01-01T00:00:00Z"}
//! ```
//!
//! Client envelopes carry the raw request in `content`; broker envelopes carry
//! the fully resolved server-side event. Envelopes are immutable once built.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::RelayError;

/// Discriminator of an envelope's `content`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeType {
    /// A chat message (client request or resolved event).
    ChatMessage,
    /// A typing indicator.
    Typing,
    /// A presence change.
    UserStatus,
    /// Server → client failure notice for a rejected frame.
    Error,
    /// Any type this build does not recognize.
    #[serde(other)]
    Unknown,
}

impl EnvelopeType {
    /// Wire name of the type.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ChatMessage => "chat_message",
            Self::Typing => "typing",
            Self::UserStatus => "user_status",
            Self::Error => "error",
            Self::Unknown => "unknown",
        }
    }
}

/// `{type, content, timestamp}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    kind: EnvelopeType,
    #[serde(default)]
    content: Value,
    #[serde(default = "Utc::now")]
    timestamp: DateTime<Utc>,
}

/// Body of an [`EnvelopeType::Error`] envelope.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorNotice {
    /// Stable machine-readable code (e.g. `persistence_failure`).
    pub code: String,
    /// Human-readable detail.
    pub message: String,
}

impl Envelope {
    /// Wrap a serializable payload, stamping the current time.
    pub fn new<T: Serialize>(kind: EnvelopeType, content: &T) -> Result<Self, RelayError> {
        Ok(Self {
            kind,
            content: serde_json::to_value(content).map_err(RelayError::Encode)?,
            timestamp: Utc::now(),
        })
    }

    /// Build an `error` envelope for the client.
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        let message: String = message.into();
        Self {
            kind: EnvelopeType::Error,
            content: serde_json::json!({ "code": code, "message": message }),
            timestamp: Utc::now(),
        }
    }

    /// Decode an envelope from a text or binary frame.
    pub fn decode(bytes: &[u8]) -> Result<Self, RelayError> {
        serde_json::from_slice(bytes).map_err(|e| RelayError::Decode(e.to_string()))
    }

    /// Serialize to the JSON text used on the wire and on the broker.
    pub fn encode(&self) -> Result<String, RelayError> {
        serde_json::to_string(self).map_err(RelayError::Encode)
    }

    /// Envelope type.
    pub fn kind(&self) -> EnvelopeType {
        self.kind
    }

    /// Raw content.
    pub fn content(&self) -> &Value {
        &self.content
    }

    /// Creation time.
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Interpret the content as `T`.
    pub fn content_as<T: DeserializeOwned>(&self) -> Result<T, RelayError> {
        T::deserialize(&self.content).map_err(|e| RelayError::Decode(e.to_string()))
    }
}
