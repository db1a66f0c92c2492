//! # relay-core
//!
//! Building blocks shared by every relay crate:
//!
//! - [`ids`]: strongly typed user, group and message identifiers
//! - [`topic`]: broker topic naming (`<prefix><kind>-<id>`) and partition keys
//! - [`envelope`]: the `{type, content, timestamp}` wrapper used on the wire and on the broker
//! - [`chat`]: chat, typing and presence payloads carried inside envelopes
//! - [`errors`]: the relay error taxonomy
//! - [`retry`]: exponential backoff math for publish retries and consumer loops
//! - [`logging`]: `tracing` subscriber initialization

#![deny(unsafe_code)]

pub mod chat;
pub mod envelope;
pub mod errors;
pub mod ids;
pub mod logging;
pub mod retry;
pub mod topic;

pub use envelope::{Envelope, EnvelopeType};
pub use errors::RelayError;
pub use ids::{GroupId, MessageId, UserId};
pub use topic::{Topic, TopicKind};
