//! # relay-store
//!
//! The narrow interfaces the relay consumes from its external collaborators:
//!
//! - [`ChatStore`]: `SaveChatEvent`, `GetUserByID`, `GetGroupMembers`
//! - [`PresenceSet`]: the globally shared online set with lease-based reconciliation
//!
//! Both come with an in-memory implementation (tests, single process) and a
//! `SQLite` implementation (durable, shareable between processes on one host).

#![deny(unsafe_code)]

pub mod database;
pub mod error;
pub mod memory;
pub mod presence;
mod schema;
pub mod sqlite;
pub mod store;

pub use database::Database;
pub use error::StoreError;
pub use memory::MemoryStore;
pub use presence::{MemoryPresence, PresenceSet};
pub use sqlite::{SqlitePresence, SqliteStore};
pub use store::ChatStore;
