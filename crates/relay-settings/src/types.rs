//! Settings types.
//!
//! Every struct uses `#[serde(default)]` so a settings file only needs the
//! keys it overrides.

use std::time::Duration;

use relay_core::retry::RetryConfig;
use relay_core::topic::DEFAULT_TOPIC_PREFIX;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::errors::{Result, SettingsError};

/// JWT secret used when none is configured. Only suitable for development.
pub const DEV_JWT_SECRET: &str = "relay-dev-secret";

/// Root settings object.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RelaySettings {
    /// HTTP/WebSocket surface and per-connection limits.
    pub server: ServerSettings,
    /// Broker connection and topic layout.
    pub broker: BrokerSettings,
    /// Persistence collaborator.
    pub store: StoreSettings,
    /// Presence set reconciliation.
    pub presence: PresenceSettings,
    /// Token verification.
    pub auth: AuthSettings,
    /// Log output.
    pub logging: LoggingSettings,
}

impl RelaySettings {
    /// Reject combinations that cannot work at runtime.
    pub fn validate(&self) -> Result<()> {
        let s = &self.server;
        if s.max_connections == 0 {
            return Err(SettingsError::InvalidValue("server.maxConnections must be > 0".into()));
        }
        if s.send_queue_capacity == 0 {
            return Err(SettingsError::InvalidValue(
                "server.sendQueueCapacity must be > 0".into(),
            ));
        }
        for (key, value) in [
            ("server.pingIntervalMs", s.ping_interval_ms),
            ("server.idleTimeoutMs", s.idle_timeout_ms),
            ("server.writeTimeoutMs", s.write_timeout_ms),
            ("server.sweepIntervalMs", s.sweep_interval_ms),
            ("broker.publishTimeoutMs", self.broker.publish_timeout_ms),
        ] {
            if value == 0 {
                return Err(SettingsError::InvalidValue(format!("{key} must be > 0")));
            }
        }
        if s.ping_interval_ms >= s.idle_timeout_ms {
            return Err(SettingsError::InvalidValue(
                "server.pingIntervalMs must be shorter than server.idleTimeoutMs".into(),
            ));
        }
        if self.presence.stale_after_ms <= s.sweep_interval_ms {
            return Err(SettingsError::InvalidValue(
                "presence.staleAfterMs must be longer than server.sweepIntervalMs".into(),
            ));
        }
        let b = &self.broker;
        if b.partitions < 1 || b.replication_factor < 1 {
            return Err(SettingsError::InvalidValue(
                "broker.partitions and broker.replicationFactor must be >= 1".into(),
            ));
        }
        if b.backend == BrokerBackend::Kafka && b.bootstrap_servers.is_empty() {
            return Err(SettingsError::InvalidValue(
                "broker.bootstrapServers is required for the kafka backend".into(),
            ));
        }
        if self.auth.jwt_secret.is_empty() {
            return Err(SettingsError::InvalidValue("auth.jwtSecret must not be empty".into()));
        }
        if self.auth.jwt_secret == DEV_JWT_SECRET {
            if b.backend == BrokerBackend::Kafka {
                return Err(SettingsError::InvalidValue(
                    "auth.jwtSecret must be set when the kafka backend is used".into(),
                ));
            }
            warn!("auth.jwtSecret is the built-in development secret");
        }
        Ok(())
    }
}

/// Server network and connection settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// HTTP/WebSocket port (`0` to auto-assign).
    pub port: u16,
    /// Process-wide cap on admitted connections.
    pub max_connections: usize,
    /// Bounded outbound queue length per connection.
    pub send_queue_capacity: usize,
    /// Idle time after which the outbound path sends a Ping.
    pub ping_interval_ms: u64,
    /// Inbound silence after which a connection is closed.
    pub idle_timeout_ms: u64,
    /// Deadline for a single transport write.
    pub write_timeout_ms: u64,
    /// Largest accepted inbound frame in bytes.
    pub max_message_size: usize,
    /// Period of the registry liveness sweep.
    pub sweep_interval_ms: u64,
    /// Upper bound on queued frames merged into one write.
    pub max_coalesced_frames: usize,
    /// Grace period for background tasks on shutdown.
    pub shutdown_timeout_ms: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            max_connections: 10_000,
            send_queue_capacity: 256,
            ping_interval_ms: 30_000,
            idle_timeout_ms: 60_000,
            write_timeout_ms: 10_000,
            max_message_size: 512 * 1024,
            sweep_interval_ms: 300_000,
            max_coalesced_frames: 64,
            shutdown_timeout_ms: 30_000,
        }
    }
}

impl ServerSettings {
    /// Ping interval as a `Duration`.
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    /// Idle timeout as a `Duration`.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// Write deadline as a `Duration`.
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    /// Sweep period as a `Duration`.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    /// Shutdown grace period as a `Duration`.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

/// Which broker transport to run against.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerBackend {
    /// In-process broker; only fans out within one process.
    #[default]
    Memory,
    /// Apache Kafka (requires the `kafka` cargo feature).
    Kafka,
}

/// Broker settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BrokerSettings {
    /// Transport backend.
    pub backend: BrokerBackend,
    /// Bootstrap broker addresses.
    pub bootstrap_servers: Vec<String>,
    /// Prefix prepended to every topic name.
    pub topic_prefix: String,
    /// Base consumer group; the effective group is `<base>-<nodeId>`.
    pub consumer_group: String,
    /// Stable id of this process. Random per start when unset.
    pub node_id: String,
    /// Partition count for lazily created topics.
    pub partitions: i32,
    /// Replication factor for lazily created topics.
    pub replication_factor: i32,
    /// `retention.ms` for lazily created topics.
    pub retention_ms: u64,
    /// Per-attempt acknowledgement deadline for publishes.
    pub publish_timeout_ms: u64,
    /// Bounded retry policy for synchronous publishes.
    pub publish_retry: RetryConfig,
    /// Upper bound on the consumer loop backoff after an error.
    pub subscribe_backoff_ms: u64,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            backend: BrokerBackend::Memory,
            bootstrap_servers: vec!["localhost:9092".to_string()],
            topic_prefix: DEFAULT_TOPIC_PREFIX.to_string(),
            consumer_group: "chatroom-group".to_string(),
            node_id: uuid::Uuid::now_v7().to_string(),
            partitions: 3,
            replication_factor: 2,
            retention_ms: 86_400_000,
            publish_timeout_ms: 5_000,
            publish_retry: RetryConfig::default(),
            subscribe_backoff_ms: 5_000,
        }
    }
}

impl BrokerSettings {
    /// Consumer group shared by every subscription of this process.
    pub fn group_id(&self) -> String {
        format!("{}-{}", self.consumer_group, self.node_id)
    }

    /// Publish deadline as a `Duration`.
    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }

    /// Consumer backoff cap as a `Duration`.
    pub fn subscribe_backoff(&self) -> Duration {
        Duration::from_millis(self.subscribe_backoff_ms)
    }
}

/// Which persistence collaborator to use.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Volatile in-process store.
    #[default]
    Memory,
    /// `SQLite` file.
    Sqlite,
}

/// Persistence settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreSettings {
    /// Store backend.
    pub backend: StoreBackend,
    /// Database path for the `SQLite` backend.
    pub path: String,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            path: "relay.db".to_string(),
        }
    }
}

/// Presence set settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PresenceSettings {
    /// Presence entries not refreshed within this window are reaped.
    pub stale_after_ms: u64,
}

impl Default for PresenceSettings {
    fn default() -> Self {
        Self {
            stale_after_ms: 600_000,
        }
    }
}

impl PresenceSettings {
    /// Lease length as a `Duration`.
    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms)
    }
}

/// Token verification settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuthSettings {
    /// HS256 secret.
    pub jwt_secret: String,
    /// Expected `iss` claim.
    pub issuer: String,
    /// Lifetime of issued tokens in seconds.
    pub token_ttl_secs: u64,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            jwt_secret: DEV_JWT_SECRET.to_string(),
            issuer: "chatroom".to_string(),
            token_ttl_secs: 86_400,
        }
    }
}

/// Log output settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of the compact format.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
