//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`RelaySettings::default()`]
//! 2. If the settings file exists, deep-merge its values over defaults
//! 3. Apply `RELAY_*` environment variable overrides (highest priority)
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::Path;

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::types::RelaySettings;

/// Load settings from `path` (if given and present) with env var overrides.
///
/// A missing file yields defaults. Invalid JSON or an invalid final
/// configuration is an error.
pub fn load_settings_from_path(path: Option<&Path>) -> Result<RelaySettings> {
    let defaults = serde_json::to_value(RelaySettings::default())?;

    let merged = match path {
        Some(path) if path.exists() => {
            debug!(?path, "loading settings from file");
            let content = std::fs::read_to_string(path)?;
            let user: Value = serde_json::from_str(&content)?;
            deep_merge(defaults, user)
        }
        Some(path) => {
            debug!(?path, "settings file not found, using defaults");
            defaults
        }
        None => defaults,
    };

    let mut settings: RelaySettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply process environment overrides to loaded settings.
pub fn apply_env_overrides(settings: &mut RelaySettings) {
    apply_overrides(settings, &|name| std::env::var(name).ok());
}

/// Apply overrides read through `lookup`.
///
/// Integers must parse and fall within range, booleans accept
/// `true`/`1`/`yes`/`on` and `false`/`0`/`no`/`off`. Invalid values are
/// logged and ignored.
pub fn apply_overrides(settings: &mut RelaySettings, lookup: &dyn Fn(&str) -> Option<String>) {
    let env = EnvReader { lookup };

    // ── Server ──────────────────────────────────────────────────────
    if let Some(v) = env.string("RELAY_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = env.u16("RELAY_PORT", 0, 65535) {
        settings.server.port = v;
    }
    if let Some(v) = env.usize("RELAY_MAX_CONNECTIONS", 1, 10_000_000) {
        settings.server.max_connections = v;
    }
    if let Some(v) = env.usize("RELAY_SEND_QUEUE_CAPACITY", 1, 1_000_000) {
        settings.server.send_queue_capacity = v;
    }
    if let Some(v) = env.u64("RELAY_PING_INTERVAL_MS", 100, 3_600_000) {
        settings.server.ping_interval_ms = v;
    }
    if let Some(v) = env.u64("RELAY_IDLE_TIMEOUT_MS", 100, 3_600_000) {
        settings.server.idle_timeout_ms = v;
    }
    if let Some(v) = env.usize("RELAY_MAX_MESSAGE_SIZE", 1024, 64 * 1024 * 1024) {
        settings.server.max_message_size = v;
    }

    // ── Broker ──────────────────────────────────────────────────────
    if let Some(v) = env.string("RELAY_BROKER_BACKEND") {
        match serde_json::from_value(Value::String(v.to_lowercase())) {
            Ok(backend) => settings.broker.backend = backend,
            Err(_) => warn!(key = "RELAY_BROKER_BACKEND", value = %v, "unknown broker backend, ignoring"),
        }
    }
    if let Some(v) = env.string("RELAY_KAFKA_BOOTSTRAP_SERVERS") {
        settings.broker.bootstrap_servers = v
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
    }
    if let Some(v) = env.string("RELAY_TOPIC_PREFIX") {
        settings.broker.topic_prefix = v;
    }
    if let Some(v) = env.string("RELAY_CONSUMER_GROUP") {
        settings.broker.consumer_group = v;
    }
    if let Some(v) = env.string("RELAY_NODE_ID") {
        settings.broker.node_id = v;
    }
    if let Some(v) = env.u64("RELAY_KAFKA_PARTITIONS", 1, 10_000) {
        settings.broker.partitions = i32::try_from(v).unwrap_or(i32::MAX);
    }
    if let Some(v) = env.u64("RELAY_KAFKA_REPLICATION_FACTOR", 1, 100) {
        settings.broker.replication_factor = i32::try_from(v).unwrap_or(i32::MAX);
    }

    // ── Store / auth / logging ──────────────────────────────────────
    if let Some(v) = env.string("RELAY_STORE_BACKEND") {
        match serde_json::from_value(Value::String(v.to_lowercase())) {
            Ok(backend) => settings.store.backend = backend,
            Err(_) => warn!(key = "RELAY_STORE_BACKEND", value = %v, "unknown store backend, ignoring"),
        }
    }
    if let Some(v) = env.string("RELAY_STORE_PATH") {
        settings.store.path = v;
    }
    if let Some(v) = env.string("RELAY_JWT_SECRET") {
        settings.auth.jwt_secret = v;
    }
    if let Some(v) = env.string("RELAY_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = env.bool("RELAY_LOG_JSON") {
        settings.logging.json = v;
    }
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Parse a string as a boolean.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u16` within a range.
pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `usize` within a range.
pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

// ── Env var readers (thin wrappers) ─────────────────────────────────────────

struct EnvReader<'a> {
    lookup: &'a dyn Fn(&str) -> Option<String>,
}

impl EnvReader<'_> {
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn parsed<T>(&self, name: &str, kind: &str, parse: impl Fn(&str) -> Option<T>) -> Option<T> {
        let val = (self.lookup)(name)?;
        let result = parse(&val);
        if result.is_none() {
            warn!(key = name, value = %val, kind, "invalid env var, ignoring");
        }
        result
    }

    fn bool(&self, name: &str) -> Option<bool> {
        self.parsed(name, "bool", parse_bool)
    }

    fn u16(&self, name: &str, min: u16, max: u16) -> Option<u16> {
        self.parsed(name, "u16", |v| parse_u16_range(v, min, max))
    }

    fn u64(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        self.parsed(name, "u64", |v| parse_u64_range(v, min, max))
    }

    fn usize(&self, name: &str, min: usize, max: usize) -> Option<usize> {
        self.parsed(name, "usize", |v| parse_usize_range(v, min, max))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
