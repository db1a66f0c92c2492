//! Branded identifier types.
//!
//! Ids are assigned by the persistence collaborator and travel as plain JSON
//! numbers. A zero id on the wire means "absent" (see [`nonzero`]).

use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! numeric_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl $name {
            /// Raw numeric value.
            pub fn get(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<u64> for $name {
            fn from(v: u64) -> Self {
                Self(v)
            }
        }
    };
}

numeric_id!(
    /// A registered user.
    UserId
);
numeric_id!(
    /// A chat group.
    GroupId
);
numeric_id!(
    /// A persisted chat event. Never zero once assigned.
    MessageId
);

/// Serde adapter for optional ids where `0` and `null` both mean "absent".
///
/// Clients written against the original HTTP API send `"group_id": 0` for
/// private messages, so a missing target is normalized to `None`.
pub mod nonzero {
    use serde::{Deserialize, Deserializer, Serializer};

    /// Deserialize an optional id, mapping `0` to `None`.
    pub fn deserialize<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
    where
        D: Deserializer<'de>,
        T: From<u64>,
    {
        let raw = Option::<u64>::deserialize(deserializer)?;
        Ok(raw.filter(|v| *v != 0).map(T::from))
    }

    /// Serialize an optional id, writing `0` for `None`.
    #[allow(clippy::ref_option)]
    pub fn serialize<S, T>(value: &Option<T>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
        T: Copy + Into<u64>,
    {
        serializer.serialize_u64(value.map_or(0, Into::into))
    }
}

impl From<UserId> for u64 {
    fn from(v: UserId) -> Self {
        v.0
    }
}

impl From<GroupId> for u64 {
    fn from(v: GroupId) -> Self {
        v.0
    }
}

impl From<MessageId> for u64 {
    fn from(v: MessageId) -> Self {
        v.0
    }
}
