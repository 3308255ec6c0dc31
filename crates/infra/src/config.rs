//! Ledger configuration and lock retry policy.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Backoff strategy between lock acquisition attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between attempts
    Fixed,
    /// Exponential backoff: base * 2^(attempt - 1)
    #[default]
    Exponential,
    /// Linear backoff: base * attempt
    Linear,
}

impl FromStr for BackoffStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fixed" => Ok(Self::Fixed),
            "exponential" => Ok(Self::Exponential),
            "linear" => Ok(Self::Linear),
            other => Err(format!("unknown backoff strategy `{other}`")),
        }
    }
}

/// Retry policy for claiming key locks.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total number of claim attempts (at least 1)
    pub max_attempts: u32,
    /// Base delay between attempts
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    /// Backoff strategy
    pub strategy: BackoffStrategy,
    /// Jitter factor (0.0-1.0) so contending writers do not retry in lockstep
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        LedgerConfig::default().retry_policy()
    }
}

impl RetryPolicy {
    /// Fail on the first contended claim.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    /// Delay after a failed attempt (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                let exp = 2_f64.powi(attempt.saturating_sub(1).min(30) as i32);
                (base_ms * exp).min(max_ms)
            }
            BackoffStrategy::Linear => (base_ms * attempt as f64).min(max_ms),
        };

        // Deterministic jitter derived from the attempt number.
        let jitter_range = delay_ms * self.jitter;
        let jitter = if jitter_range > 0.0 {
            let pseudo_random = ((attempt as f64 * 17.0) % 100.0) / 100.0;
            jitter_range * (pseudo_random - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_micros(((delay_ms + jitter).max(0.0) * 1000.0) as u64)
    }

    /// Whether another attempt is allowed after `attempt` failed ones.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

pub const ENV_LOCK_MAX_ATTEMPTS: &str = "LEDGER_LOCK_MAX_ATTEMPTS";
pub const ENV_LOCK_BACKOFF: &str = "LEDGER_LOCK_BACKOFF";
pub const ENV_LOCK_BASE_DELAY_MS: &str = "LEDGER_LOCK_BASE_DELAY_MS";
pub const ENV_LOCK_MAX_DELAY_MS: &str = "LEDGER_LOCK_MAX_DELAY_MS";
pub const ENV_MOVEMENT_PREFIX: &str = "LEDGER_MOVEMENT_PREFIX";

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub lock_max_attempts: u32,
    pub lock_backoff: BackoffStrategy,
    pub lock_base_delay_ms: u64,
    pub lock_max_delay_ms: u64,
    /// Display prefix of movement numbers (`MOV-00000042`).
    pub movement_prefix: String,
    /// Initial capacity of the outbox.
    pub outbox_capacity: usize,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            lock_max_attempts: 8,
            lock_backoff: BackoffStrategy::Exponential,
            lock_base_delay_ms: 2,
            lock_max_delay_ms: 50,
            movement_prefix: "MOV".to_string(),
            outbox_capacity: 1024,
        }
    }
}

impl LedgerConfig {
    /// Defaults overridden by `LEDGER_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns. Unparsable values are
    /// logged and ignored.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(v) = parse_var(&lookup, ENV_LOCK_MAX_ATTEMPTS) {
            config.lock_max_attempts = v;
        }
        if let Some(v) = parse_var(&lookup, ENV_LOCK_BACKOFF) {
            config.lock_backoff = v;
        }
        if let Some(v) = parse_var(&lookup, ENV_LOCK_BASE_DELAY_MS) {
            config.lock_base_delay_ms = v;
        }
        if let Some(v) = parse_var(&lookup, ENV_LOCK_MAX_DELAY_MS) {
            config.lock_max_delay_ms = v;
        }
        if let Some(prefix) = lookup(ENV_MOVEMENT_PREFIX) {
            let prefix = prefix.trim();
            if prefix.is_empty() {
                warn!(var = ENV_MOVEMENT_PREFIX, "empty movement prefix, using default");
            } else {
                config.movement_prefix = prefix.to_string();
            }
        }

        config
    }

    pub fn with_lock_max_attempts(mut self, attempts: u32) -> Self {
        self.lock_max_attempts = attempts;
        self
    }

    pub fn with_lock_backoff(mut self, strategy: BackoffStrategy) -> Self {
        self.lock_backoff = strategy;
        self
    }

    pub fn with_lock_delays(mut self, base_ms: u64, max_ms: u64) -> Self {
        self.lock_base_delay_ms = base_ms;
        self.lock_max_delay_ms = max_ms;
        self
    }

    pub fn with_movement_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.movement_prefix = prefix.into();
        self
    }

    pub fn with_outbox_capacity(mut self, capacity: usize) -> Self {
        self.outbox_capacity = capacity;
        self
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.lock_max_attempts.max(1),
            base_delay: Duration::from_millis(self.lock_base_delay_ms),
            max_delay: Duration::from_millis(self.lock_max_delay_ms.max(self.lock_base_delay_ms)),
            strategy: self.lock_backoff,
            jitter: 0.1,
        }
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(var = key, value = %raw, "invalid configuration value, using default");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_without_environment() {
        let config = LedgerConfig::from_lookup(|_| None);
        assert_eq!(config, LedgerConfig::default());
        assert_eq!(config.lock_max_attempts, 8);
        assert_eq!(config.movement_prefix, "MOV");
    }

    #[test]
    fn environment_overrides_and_bad_values_fall_back() {
        let config = LedgerConfig::from_lookup(lookup(&[
            (ENV_LOCK_MAX_ATTEMPTS, "3"),
            (ENV_LOCK_BACKOFF, "Linear"),
            (ENV_LOCK_BASE_DELAY_MS, "not-a-number"),
            (ENV_MOVEMENT_PREFIX, " WH1 "),
        ]));
        assert_eq!(config.lock_max_attempts, 3);
        assert_eq!(config.lock_backoff, BackoffStrategy::Linear);
        assert_eq!(config.lock_base_delay_ms, 2);
        assert_eq!(config.movement_prefix, "WH1");
    }

    #[test]
    fn deserializes_partial_documents() {
        let config: LedgerConfig =
            serde_json::from_str(r#"{ "lock_backoff": "fixed", "movement_prefix": "STK" }"#)
                .unwrap();
        assert_eq!(config.lock_backoff, BackoffStrategy::Fixed);
        assert_eq!(config.movement_prefix, "STK");
        assert_eq!(config.lock_max_attempts, 8);
    }

    #[test]
    fn exponential_backoff_is_capped() {
        let policy = RetryPolicy {
            jitter: 0.0,
            ..LedgerConfig::default().retry_policy()
        };
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(2));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(8));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_millis(50));
    }

    #[test]
    fn linear_and_fixed_backoff() {
        let linear = RetryPolicy {
            strategy: BackoffStrategy::Linear,
            jitter: 0.0,
            ..LedgerConfig::default().retry_policy()
        };
        assert_eq!(linear.delay_for_attempt(4), Duration::from_millis(8));

        let fixed = RetryPolicy::fixed(3, Duration::from_millis(5));
        assert_eq!(fixed.delay_for_attempt(7), Duration::from_millis(5));
        assert!(fixed.should_retry(2));
        assert!(!fixed.should_retry(3));
    }

    #[test]
    fn zero_attempts_still_tries_once() {
        let policy = LedgerConfig::default().with_lock_max_attempts(0).retry_policy();
        assert_eq!(policy.max_attempts, 1);
        assert!(!RetryPolicy::no_retry().should_retry(1));
    }
}
