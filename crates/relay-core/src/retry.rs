//! Retry configuration and backoff calculation.
//!
//! Used by the broker adapter for bounded publish retries and by the
//! consumer loops, which back off indefinitely on transient errors.

use std::time::Duration;

use serde::{Deserialize, Serialize};

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Default maximum retries for a synchronous publish.
pub const DEFAULT_MAX_RETRIES: u32 = 5;
/// Default base delay in milliseconds.
pub const DEFAULT_BASE_DELAY_MS: u64 = 100;
/// Default maximum delay in milliseconds.
pub const DEFAULT_MAX_DELAY_MS: u64 = 5_000;
/// Default jitter factor (0.0–1.0).
pub const DEFAULT_JITTER_FACTOR: f64 = 0.2;

/// Configuration for retry logic.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    /// Maximum number of retry attempts after the first try (default: 5).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base delay for exponential backoff in ms (default: 100).
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Maximum delay between retries in ms (default: 5000).
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Jitter factor 0.0–1.0 (default: 0.2).
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}
fn default_base_delay_ms() -> u64 {
    DEFAULT_BASE_DELAY_MS
}
fn default_max_delay_ms() -> u64 {
    DEFAULT_MAX_DELAY_MS
}
fn default_jitter_factor() -> f64 {
    DEFAULT_JITTER_FACTOR
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            jitter_factor: DEFAULT_JITTER_FACTOR,
        }
    }
}

impl RetryConfig {
    /// Randomized delay before retry number `attempt` (zero-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        Duration::from_millis(calculate_backoff_delay_with_random(
            attempt,
            self.base_delay_ms,
            self.max_delay_ms,
            self.jitter_factor,
            rand::random::<f64>(),
        ))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Backoff calculation
// ─────────────────────────────────────────────────────────────────────────────

/// Calculate backoff delay with explicit randomness.
///
/// Formula: `min(max_delay, base_delay * 2^attempt) * (1 + (random * 2 - 1) * jitter)`.
/// `random` should be a value in `[0.0, 1.0)` from a PRNG.
#[must_use]
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
pub fn calculate_backoff_delay_with_random(
    attempt: u32,
    base_delay_ms: u64,
    max_delay_ms: u64,
    jitter_factor: f64,
    random: f64,
) -> u64 {
    let exponential = base_delay_ms.saturating_mul(1u64 << attempt.min(31));
    let capped = exponential.min(max_delay_ms);

    // Maps random [0,1) to [-jitter, +jitter]
    let jitter = 1.0 + (random * 2.0 - 1.0) * jitter_factor.clamp(0.0, 1.0);
    let with_jitter = (capped as f64) * jitter;

    with_jitter.round().max(0.0) as u64
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = RetryConfig::default();
        assert_eq!(cfg.max_retries, 5);
        assert_eq!(cfg.base_delay_ms, 100);
        assert_eq!(cfg.max_delay_ms, 5_000);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let cfg: RetryConfig = serde_json::from_str(r#"{"maxRetries":2}"#).unwrap();
        assert_eq!(cfg.max_retries, 2);
        assert_eq!(cfg.base_delay_ms, DEFAULT_BASE_DELAY_MS);
    }

    #[test]
    fn midpoint_random_has_no_jitter() {
        assert_eq!(calculate_backoff_delay_with_random(0, 100, 5_000, 0.2, 0.5), 100);
        assert_eq!(calculate_backoff_delay_with_random(3, 100, 5_000, 0.2, 0.5), 800);
    }

    #[test]
    fn delay_is_capped() {
        assert_eq!(calculate_backoff_delay_with_random(20, 100, 5_000, 0.0, 0.9), 5_000);
    }

    #[test]
    fn huge_attempt_does_not_overflow() {
        let d = calculate_backoff_delay_with_random(u32::MAX, u64::MAX, u64::MAX, 0.0, 0.0);
        assert_eq!(d as f64, u64::MAX as f64);
    }

    #[test]
    fn jitter_stays_in_band() {
        for r in [0.0, 0.25, 0.75, 0.999] {
            let d = calculate_backoff_delay_with_random(2, 100, 5_000, 0.2, r);
            assert!((320..=480).contains(&d), "{d} out of band for {r}");
        }
    }

    #[test]
    fn delay_for_respects_band() {
        let cfg = RetryConfig {
            max_retries: 3,
            base_delay_ms: 10,
            max_delay_ms: 1_000,
            jitter_factor: 0.5,
        };
        let d = cfg.delay_for(1).as_millis();
        assert!((10..=30).contains(&d));
    }
}
