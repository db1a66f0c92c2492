//! `SQLite` implementations of [`ChatStore`] and [`PresenceSet`].
//!
//! Several relay processes on one host can point at the same database file
//! and observe one presence set.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use relay_core::chat::{ChatEvent, UserProfile};
use relay_core::ids::{GroupId, MessageId, UserId};
use rusqlite::{OptionalExtension, params};

use crate::database::Database;
use crate::error::StoreError;
use crate::presence::PresenceSet;
use crate::store::ChatStore;

fn to_sql(id: u64) -> Result<i64, StoreError> {
    i64::try_from(id).map_err(|_| StoreError::Database(format!("id {id} exceeds i64")))
}

fn from_sql(id: i64) -> Result<u64, StoreError> {
    u64::try_from(id).map_err(|_| StoreError::Database(format!("negative id {id}")))
}

/// Durable [`ChatStore`].
#[derive(Clone)]
pub struct SqliteStore {
    db: Database,
}

impl SqliteStore {
    /// Wrap an open database.
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert or update a user profile.
    pub fn upsert_user(&self, profile: &UserProfile) -> Result<(), StoreError> {
        let id = to_sql(profile.id.get())?;
        self.db.with_conn(|conn| {
            let _ = conn.execute(
                "INSERT INTO users (id, username, avatar) VALUES (?1, ?2, ?3)
                 ON CONFLICT(id) DO UPDATE SET username = excluded.username, avatar = excluded.avatar",
                params![id, profile.username, profile.avatar],
            )?;
            Ok(())
        })
    }

    /// Add `user` to `group`.
    pub fn add_group_member(&self, group: GroupId, user: UserId) -> Result<(), StoreError> {
        let (g, u) = (to_sql(group.get())?, to_sql(user.get())?);
        self.db.with_conn(|conn| {
            let _ = conn.execute(
                "INSERT OR IGNORE INTO group_members (group_id, user_id) VALUES (?1, ?2)",
                params![g, u],
            )?;
            Ok(())
        })
    }
}

#[async_trait]
impl ChatStore for SqliteStore {
    async fn save_chat_event(&self, event: &ChatEvent) -> Result<MessageId, StoreError> {
        let sender = to_sql(event.sender_id.get())?;
        let receiver = event.receiver_id.map(|u| to_sql(u.get())).transpose()?;
        let group = event.group_id.map(|g| to_sql(g.get())).transpose()?;
        let id = self.db.with_conn(|conn| {
            let _ = conn.execute(
                "INSERT INTO messages (content, kind, sender_id, receiver_id, group_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    event.content,
                    event.kind.as_str(),
                    sender,
                    receiver,
                    group,
                    event.created_at.to_rfc3339(),
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })?;
        Ok(MessageId(from_sql(id)?))
    }

    async fn get_user_by_id(&self, id: UserId) -> Result<Option<UserProfile>, StoreError> {
        let key = to_sql(id.get())?;
        self.db.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT username, avatar FROM users WHERE id = ?1",
                    [key],
                    |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
                )
                .optional()?;
            Ok(row.map(|(username, avatar)| UserProfile {
                id,
                username,
                avatar,
            }))
        })
    }

    async fn get_group_members(&self, group: GroupId) -> Result<Vec<UserId>, StoreError> {
        let key = to_sql(group.get())?;
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT user_id FROM group_members WHERE group_id = ?1 ORDER BY user_id",
            )?;
            let ids = stmt
                .query_map([key], |row| row.get::<_, i64>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            ids.into_iter()
                .map(|id| from_sql(id).map(UserId))
                .collect()
        })
    }
}

/// [`PresenceSet`] stored in the `presence` table.
#[derive(Clone)]
pub struct SqlitePresence {
    db: Database,
}

impl SqlitePresence {
    /// Wrap an open database.
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl PresenceSet for SqlitePresence {
    async fn mark_online(&self, user: UserId, node: &str) -> Result<(), StoreError> {
        let key = to_sql(user.get())?;
        self.db.with_conn(|conn| {
            let _ = conn.execute(
                "INSERT INTO presence (user_id, node, refreshed_at_ms) VALUES (?1, ?2, ?3)
                 ON CONFLICT(user_id) DO UPDATE SET node = excluded.node,
                     refreshed_at_ms = excluded.refreshed_at_ms",
                params![key, node, Utc::now().timestamp_millis()],
            )?;
            Ok(())
        })
    }

    async fn mark_offline(&self, user: UserId, node: &str) -> Result<bool, StoreError> {
        let key = to_sql(user.get())?;
        self.db.with_conn(|conn| {
            let removed = conn.execute(
                "DELETE FROM presence WHERE user_id = ?1 AND node = ?2",
                params![key, node],
            )?;
            Ok(removed > 0)
        })
    }

    async fn refresh(&self, users: &[UserId], node: &str) -> Result<(), StoreError> {
        let keys = users
            .iter()
            .map(|u| to_sql(u.get()))
            .collect::<Result<Vec<_>, _>>()?;
        let now = Utc::now().timestamp_millis();
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "UPDATE presence SET refreshed_at_ms = ?1 WHERE user_id = ?2 AND node = ?3",
            )?;
            for key in keys {
                let _ = stmt.execute(params![now, key, node])?;
            }
            Ok(())
        })
    }

    async fn members(&self) -> Result<Vec<UserId>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare_cached("SELECT user_id FROM presence ORDER BY user_id")?;
            let ids = stmt
                .query_map([], |row| row.get::<_, i64>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            ids.into_iter()
                .map(|id| from_sql(id).map(UserId))
                .collect()
        })
    }

    async fn reap_stale(&self, older_than: Duration) -> Result<Vec<UserId>, StoreError> {
        let cutoff = Utc::now().timestamp_millis()
            - i64::try_from(older_than.as_millis()).unwrap_or(i64::MAX);
        self.db.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            let ids = {
                let mut stmt =
                    tx.prepare("SELECT user_id FROM presence WHERE refreshed_at_ms <= ?1")?;
                stmt.query_map([cutoff], |row| row.get::<_, i64>(0))?
                    .collect::<Result<Vec<_>, _>>()?
            };
            let _ = tx.execute("DELETE FROM presence WHERE refreshed_at_ms <= ?1", [cutoff])?;
            tx.commit()?;
            ids.into_iter()
                .map(|id| from_sql(id).map(UserId))
                .collect()
        })
    }
}
