//! # relay-server
//!
//! The per-process half of the relay:
//!
//! - [`registry`]: local connections, presence bookkeeping and reconciliation
//! - [`session`]: the read and write pumps of one WebSocket
//! - [`distribution`]: persist-then-publish for chat, typing and status events
//! - [`node`]: registry, broker adapter and distributor wired together
//! - [`server`]: axum routes (`/ws`, `/messages`, `/online`, `/stats`, `/health`, `/metrics`)

#![deny(unsafe_code)]

pub mod auth;
pub mod connection;
pub mod distribution;
pub mod health;
pub mod metrics;
pub mod node;
pub mod registry;
pub mod server;
pub mod session;
pub mod shutdown;

pub use auth::{AuthError, Authenticator, Identity, JwtAuthenticator};
pub use connection::{ConnectionHandle, Frame};
pub use distribution::Distributor;
pub use node::RelayNode;
pub use registry::{Admission, ConnectionRegistry, RegistryConfig, StatusNotifier};
pub use server::{AppState, RelayServer};
pub use session::SessionConfig;
pub use shutdown::{ShutdownCoordinator, ShutdownReport};
