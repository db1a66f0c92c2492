//! The persistence collaborator.

use async_trait::async_trait;
use relay_core::chat::{ChatEvent, UserProfile};
use relay_core::ids::{GroupId, MessageId, UserId};

use crate::error::StoreError;

/// Narrow persistence interface consulted by message distribution.
#[async_trait]
pub trait ChatStore: Send + Sync {
    /// Durably record a chat event and return its assigned, non-zero id.
    async fn save_chat_event(&self, event: &ChatEvent) -> Result<MessageId, StoreError>;

    /// Look up a user's display profile.
    async fn get_user_by_id(&self, id: UserId) -> Result<Option<UserProfile>, StoreError>;

    /// Current members of a group. Unknown groups have no members.
    async fn get_group_members(&self, group: GroupId) -> Result<Vec<UserId>, StoreError>;
}
