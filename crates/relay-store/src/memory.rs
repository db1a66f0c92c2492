//! Volatile in-process store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use relay_core::chat::{ChatEvent, UserProfile};
use relay_core::ids::{GroupId, MessageId, UserId};

use crate::error::StoreError;
use crate::store::ChatStore;

#[derive(Default)]
struct Inner {
    next_id: u64,
    events: Vec<ChatEvent>,
    users: HashMap<UserId, UserProfile>,
    groups: HashMap<GroupId, Vec<UserId>>,
}

/// [`ChatStore`] backed by process memory.
///
/// Shared between several relay nodes in tests to stand in for the external
/// database. `set_failing` makes every write fail until cleared.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    failing: AtomicBool,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a user profile.
    pub fn add_user(&self, id: UserId, username: &str) {
        let profile = UserProfile {
            id,
            username: username.to_string(),
            avatar: String::new(),
        };
        let _ = self.inner.lock().users.insert(id, profile);
    }

    /// Add `user` to `group`, creating the group if needed.
    pub fn add_group_member(&self, group: GroupId, user: UserId) {
        let mut inner = self.inner.lock();
        let members = inner.groups.entry(group).or_default();
        if !members.contains(&user) {
            members.push(user);
        }
    }

    /// Make subsequent `save_chat_event` calls fail.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Every persisted event, in save order.
    pub fn events(&self) -> Vec<ChatEvent> {
        self.inner.lock().events.clone()
    }
}

#[async_trait]
impl ChatStore for MemoryStore {
    async fn save_chat_event(&self, event: &ChatEvent) -> Result<MessageId, StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store is failing writes".into()));
        }
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let id = MessageId(inner.next_id);
        let mut stored = event.clone();
        stored.id = Some(id);
        inner.events.push(stored);
        Ok(id)
    }

    async fn get_user_by_id(&self, id: UserId) -> Result<Option<UserProfile>, StoreError> {
        Ok(self.inner.lock().users.get(&id).cloned())
    }

    async fn get_group_members(&self, group: GroupId) -> Result<Vec<UserId>, StoreError> {
        Ok(self.inner.lock().groups.get(&group).cloned().unwrap_or_default())
    }
}
