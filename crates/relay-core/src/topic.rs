//! Broker topic naming.
//!
//! A topic is identified by a `(kind, id)` pair and its name is derived as
//! `prefix + kind + "-" + id`. Kinds never share a name space, so
//! `private-7` and `group-7` are distinct channels.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ids::{GroupId, UserId};

/// Default prefix prepended to every topic name.
pub const DEFAULT_TOPIC_PREFIX: &str = "chatroom-";

/// Routing kind of a topic.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TopicKind {
    /// Events addressed to a single user.
    Private,
    /// Events addressed to a group.
    Group,
    /// System-wide broadcasts.
    Global,
    /// Presence changes (`user_status` envelopes).
    Status,
}

impl TopicKind {
    /// Wire name of the kind.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Private => "private",
            Self::Group => "group",
            Self::Global => "global",
            Self::Status => "status",
        }
    }
}

impl fmt::Display for TopicKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A broker channel addressed by kind and target id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Topic {
    /// Routing kind.
    pub kind: TopicKind,
    /// Target id (user id, group id, or `0` for the well-known topics).
    pub id: u64,
}

impl Topic {
    /// Per-user delivery topic.
    pub fn private(user: UserId) -> Self {
        Self {
            kind: TopicKind::Private,
            id: user.get(),
        }
    }

    /// Group topic.
    pub fn group(group: GroupId) -> Self {
        Self {
            kind: TopicKind::Group,
            id: group.get(),
        }
    }

    /// The system broadcast topic (`global-0`).
    pub fn global() -> Self {
        Self {
            kind: TopicKind::Global,
            id: 0,
        }
    }

    /// The presence topic (`status-0`).
    pub fn status() -> Self {
        Self {
            kind: TopicKind::Status,
            id: 0,
        }
    }

    /// Full broker topic name under `prefix`.
    pub fn name(&self, prefix: &str) -> String {
        format!("{prefix}{}-{}", self.kind, self.id)
    }

    /// Partition key for records published to this topic.
    ///
    /// Records for the same user or group land on the same partition, which
    /// keeps per-recipient order within one topic.
    pub fn partition_key(&self) -> String {
        match self.kind {
            TopicKind::Private => format!("user-{}", self.id),
            TopicKind::Group => format!("group-{}", self.id),
            TopicKind::Global => "global".into(),
            TopicKind::Status => "status".into(),
        }
    }

    /// Parse a full topic name produced by [`Topic::name`] with the same prefix.
    pub fn parse(name: &str, prefix: &str) -> Option<Self> {
        let rest = name.strip_prefix(prefix)?;
        let (kind, id) = rest.rsplit_once('-')?;
        let kind = match kind {
            "private" => TopicKind::Private,
            "group" => TopicKind::Group,
            "global" => TopicKind::Global,
            "status" => TopicKind::Status,
            _ => return None,
        };
        Some(Self {
            kind,
            id: id.parse().ok()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn private_topic_name() {
        let t = Topic::private(UserId(42));
        assert_eq!(t.name(DEFAULT_TOPIC_PREFIX), "chatroom-private-42");
        assert_eq!(t.partition_key(), "user-42");
    }

    #[test]
    fn group_topic_name() {
        let t = Topic::group(GroupId(3));
        assert_eq!(t.name("x-"), "x-group-3");
        assert_eq!(t.partition_key(), "group-3");
    }

    #[test]
    fn well_known_topics() {
        assert_eq!(Topic::global().name(DEFAULT_TOPIC_PREFIX), "chatroom-global-0");
        assert_eq!(Topic::status().name(DEFAULT_TOPIC_PREFIX), "chatroom-status-0");
        assert_eq!(Topic::global().partition_key(), "global");
    }

    #[test]
    fn same_id_different_kind_never_collide() {
        let a = Topic::private(UserId(7)).name("");
        let b = Topic::group(GroupId(7)).name("");
        assert_ne!(a, b);
    }

    #[test]
    fn parse_rejects_foreign_prefix() {
        assert!(Topic::parse("other-private-1", DEFAULT_TOPIC_PREFIX).is_none());
        assert!(Topic::parse("chatroom-bogus-1", DEFAULT_TOPIC_PREFIX).is_none());
        assert!(Topic::parse("chatroom-private-x", DEFAULT_TOPIC_PREFIX).is_none());
    }

    proptest! {
        #[test]
        fn name_is_pure_and_parseable(id in 0u64..u64::MAX, kind in 0u8..4) {
            let kind = match kind {
                0 => TopicKind::Private,
                1 => TopicKind::Group,
                2 => TopicKind::Global,
                _ => TopicKind::Status,
            };
            let topic = Topic { kind, id };
            let name = topic.name(DEFAULT_TOPIC_PREFIX);
            prop_assert_eq!(&name, &topic.name(DEFAULT_TOPIC_PREFIX));
            prop_assert_eq!(Topic::parse(&name, DEFAULT_TOPIC_PREFIX), Some(topic));
        }
    }
}
