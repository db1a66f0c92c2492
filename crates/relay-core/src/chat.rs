//! Payloads carried inside envelopes.
//!
//! Client → server requests ([`ChatRequest`], [`TypingRequest`]) are the raw
//! shapes a client sends; the server-side events ([`ChatEventView`],
//! [`TypingNotice`], [`UserStatus`]) are what subscribers receive.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::RelayError;
use crate::ids::{nonzero, GroupId, MessageId, UserId};

/// Kind of a chat event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatKind {
    /// One-to-one message.
    Private,
    /// Message to every member of a group.
    Group,
    /// System-wide announcement.
    System,
}

impl ChatKind {
    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Private => "private",
            Self::Group => "group",
            Self::System => "system",
        }
    }
}

/// Where an event must be routed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChatTarget {
    /// A single user.
    User(UserId),
    /// Every member of a group.
    Group(GroupId),
    /// Every connected user.
    Everyone,
}

/// `chat_message` content sent by a client.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatRequest {
    /// Message text.
    pub content: String,
    /// Chat kind.
    #[serde(rename = "type")]
    pub kind: ChatKind,
    /// Recipient for private messages.
    #[serde(default, with = "nonzero")]
    pub receiver_id: Option<UserId>,
    /// Group for group messages.
    #[serde(default, with = "nonzero")]
    pub group_id: Option<GroupId>,
}

impl ChatRequest {
    /// Validate the request and resolve its routing target.
    pub fn target(&self) -> Result<ChatTarget, RelayError> {
        if self.content.trim().is_empty() {
            return Err(RelayError::InvalidRequest("message content is empty".into()));
        }
        match self.kind {
            ChatKind::Private => self
                .receiver_id
                .map(ChatTarget::User)
                .ok_or_else(|| RelayError::InvalidRequest("private message without receiver_id".into())),
            ChatKind::Group => self
                .group_id
                .map(ChatTarget::Group)
                .ok_or_else(|| RelayError::InvalidRequest("group message without group_id".into())),
            ChatKind::System => Ok(ChatTarget::Everyone),
        }
    }
}

/// `typing` content sent by a client.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingRequest {
    /// Peer being typed to.
    #[serde(default, with = "nonzero")]
    pub receiver_id: Option<UserId>,
    /// Group being typed in.
    #[serde(default, with = "nonzero")]
    pub group_id: Option<GroupId>,
}

impl TypingRequest {
    /// Resolve the routing target; a group wins over a receiver.
    pub fn target(&self) -> Result<ChatTarget, RelayError> {
        match (self.group_id, self.receiver_id) {
            (Some(g), _) => Ok(ChatTarget::Group(g)),
            (None, Some(u)) => Ok(ChatTarget::User(u)),
            (None, None) => Err(RelayError::InvalidRequest(
                "typing indicator without receiver_id or group_id".into(),
            )),
        }
    }
}

/// A chat event as built by the server. `id` is assigned by the store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatEvent {
    /// Store-assigned id, absent until persisted.
    pub id: Option<MessageId>,
    /// Message text.
    pub content: String,
    /// Chat kind.
    pub kind: ChatKind,
    /// Author.
    pub sender_id: UserId,
    /// Recipient of a private message.
    pub receiver_id: Option<UserId>,
    /// Group of a group message.
    pub group_id: Option<GroupId>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl ChatEvent {
    /// Build an unpersisted event from a client request.
    pub fn from_request(sender: UserId, req: &ChatRequest) -> Self {
        Self {
            id: None,
            content: req.content.clone(),
            kind: req.kind,
            sender_id: sender,
            receiver_id: req.receiver_id,
            group_id: req.group_id,
            created_at: Utc::now(),
        }
    }
}

/// Profile of a registered user as known to the store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    /// User id.
    pub id: UserId,
    /// Display name.
    pub username: String,
    /// Avatar URL, possibly empty.
    #[serde(default)]
    pub avatar: String,
}

/// Sender display fields embedded in a resolved chat event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderProfile {
    /// User id.
    pub id: UserId,
    /// Display name.
    pub username: String,
    /// Avatar URL, possibly empty.
    #[serde(default)]
    pub avatar: String,
    /// Whether the sender is online (always true for live senders).
    pub online: bool,
}

/// `chat_message` content published to the broker.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatEventView {
    /// Persisted id.
    pub id: MessageId,
    /// Message text.
    pub content: String,
    /// Chat kind.
    #[serde(rename = "type")]
    pub kind: ChatKind,
    /// Author.
    pub sender_id: UserId,
    /// Author display fields.
    pub sender: SenderProfile,
    /// Recipient of a private message.
    #[serde(default, with = "nonzero")]
    pub receiver_id: Option<UserId>,
    /// Group of a group message.
    #[serde(default, with = "nonzero")]
    pub group_id: Option<GroupId>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl ChatEventView {
    /// Resolve a persisted event with its sender's display fields.
    pub fn resolve(id: MessageId, event: &ChatEvent, sender: SenderProfile) -> Self {
        Self {
            id,
            content: event.content.clone(),
            kind: event.kind,
            sender_id: event.sender_id,
            sender,
            receiver_id: event.receiver_id,
            group_id: event.group_id,
            created_at: event.created_at,
        }
    }
}

/// `typing` content published to the broker.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingNotice {
    /// Who is typing.
    pub sender_id: UserId,
    /// Their display name.
    pub username: String,
    /// Peer being typed to.
    #[serde(default, with = "nonzero")]
    pub receiver_id: Option<UserId>,
    /// Group being typed in.
    #[serde(default, with = "nonzero")]
    pub group_id: Option<GroupId>,
}

/// Online/offline marker.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    /// The user holds a live connection.
    Online,
    /// The user's last connection closed.
    Offline,
}

/// `user_status` content published to the status topic.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserStatus {
    /// Subject.
    pub user_id: UserId,
    /// Display name.
    pub username: String,
    /// New status.
    pub status: PresenceStatus,
}
