//! Engine configuration.
//!
//! Configuration comes from `CONSENT_*` environment variables; every value
//! has a default so an empty environment yields a working engine.
//!
//! | Variable | Default |
//! |---|---|
//! | `CONSENT_BUS_SHARDS` | 8 |
//! | `CONSENT_SEND_MAX_RETRIES` | 3 |
//! | `CONSENT_SEND_INITIAL_DELAY_MS` | 1000 |
//! | `CONSENT_SEND_MAX_DELAY_MS` | 60000 |
//! | `CONSENT_SEND_BACKOFF_MULTIPLIER` | 2.0 |
//! | `CONSENT_TERMINATION_MAX_RETRIES` | 5 |
//! | `CONSENT_TERMINATION_INITIAL_DELAY_MS` | 1000 |
//! | `CONSENT_TERMINATION_MAX_DELAY_MS` | 60000 |
//! | `CONSENT_TERMINATION_BACKOFF_MULTIPLIER` | 2.0 |
//! | `CONSENT_STALE_AFTER_HOURS` | 168 |
//! | `CONSENT_SWEEP_INTERVAL_SECS` | 3600 |
//! | `CONSENT_POLL_INTERVAL_SECS` | 3600 |
//! | `CONSENT_POLL_MAX_RETRIES` | 5 |
//! | `CONSENT_POLL_INITIAL_DELAY_MS` | 60000 |
//! | `CONSENT_POLL_MAX_DELAY_MS` | 3600000 |
//! | `CONSENT_POLL_BACKOFF_MULTIPLIER` | 2.0 |
//! | `CONSENT_TERMINATE_ON_FULFILLMENT` | false |
//! | `CONSENT_TERMINATE_EXTERNALLY` | true |
//!
//! # Example
//!
//! ```no_run
//! use consent_runtime::config::EngineConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = EngineConfig::from_env()?;
//! println!("Bus shards: {}", config.bus_shards);
//! # Ok(())
//! # }
//! ```

use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Configuration error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A variable is set but cannot be parsed.
    #[error("Invalid value for {key}: {reason}")]
    Invalid {
        /// The offending variable.
        key: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The values parse but do not make sense together.
    #[error("Configuration validation failed: {0}")]
    Validation(String),
}

/// Runtime knobs of the lifecycle engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Worker shards per bus subscription.
    pub bus_shards: usize,
    /// Retry budget of `UNABLE_TO_SEND → VALIDATED`.
    pub send_retry: RetryPolicy,
    /// Retry budget of `FAILED_TO_TERMINATE → REQUIRES_EXTERNAL_TERMINATION`.
    pub termination_retry: RetryPolicy,
    /// How long a request may wait for the customer's answer.
    pub stale_after_hours: u32,
    /// Period of the stale request sweeper.
    pub sweep_interval_secs: u64,
    /// Period of the metering data poller.
    pub poll_interval_secs: u64,
    /// Backoff of the metering data poller after transient failures.
    pub poll_retry: RetryPolicy,
    /// Drive fulfilled requests into external termination.
    pub terminate_on_fulfillment: bool,
    /// Drive terminated requests into external termination.
    pub terminate_externally: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            bus_shards: 8,
            send_retry: RetryPolicy::new()
                .with_max_attempts(3)
                .with_initial_delay(Duration::from_secs(1))
                .with_max_delay(Duration::from_secs(60)),
            termination_retry: RetryPolicy::new()
                .with_max_attempts(5)
                .with_initial_delay(Duration::from_secs(1))
                .with_max_delay(Duration::from_secs(60)),
            stale_after_hours: 168,
            sweep_interval_secs: 3600,
            poll_interval_secs: 3600,
            poll_retry: RetryPolicy::new()
                .with_max_attempts(5)
                .with_initial_delay(Duration::from_secs(60))
                .with_max_delay(Duration::from_secs(3600)),
            terminate_on_fulfillment: false,
            terminate_externally: true,
        }
    }
}

impl EngineConfig {
    /// Load configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a variable cannot be parsed or the result
    /// fails [`EngineConfig::validate`].
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// Same as [`EngineConfig::from_env`].
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let config = Self {
            bus_shards: parse_or(&lookup, "CONSENT_BUS_SHARDS", defaults.bus_shards)?,
            send_retry: retry_policy(&lookup, "CONSENT_SEND", defaults.send_retry)?,
            termination_retry: retry_policy(&lookup, "CONSENT_TERMINATION", defaults.termination_retry)?,
            stale_after_hours: parse_or(&lookup, "CONSENT_STALE_AFTER_HOURS", defaults.stale_after_hours)?,
            sweep_interval_secs: parse_or(&lookup, "CONSENT_SWEEP_INTERVAL_SECS", defaults.sweep_interval_secs)?,
            poll_interval_secs: parse_or(&lookup, "CONSENT_POLL_INTERVAL_SECS", defaults.poll_interval_secs)?,
            poll_retry: retry_policy(&lookup, "CONSENT_POLL", defaults.poll_retry)?,
            terminate_on_fulfillment: parse_or(
                &lookup,
                "CONSENT_TERMINATE_ON_FULFILLMENT",
                defaults.terminate_on_fulfillment,
            )?,
            terminate_externally: parse_or(&lookup, "CONSENT_TERMINATE_EXTERNALLY", defaults.terminate_externally)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] for values that parse but cannot work.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bus_shards == 0 {
            return Err(ConfigError::Validation("bus_shards must be > 0".to_string()));
        }
        if self.stale_after_hours == 0 {
            return Err(ConfigError::Validation("stale_after_hours must be > 0".to_string()));
        }
        if self.sweep_interval_secs == 0 {
            return Err(ConfigError::Validation("sweep_interval_secs must be > 0".to_string()));
        }
        if self.poll_interval_secs == 0 {
            return Err(ConfigError::Validation("poll_interval_secs must be > 0".to_string()));
        }
        for (name, policy) in [
            ("send", &self.send_retry),
            ("termination", &self.termination_retry),
            ("poll", &self.poll_retry),
        ] {
            if policy.backoff_multiplier() < 1.0 || !policy.backoff_multiplier().is_finite() {
                return Err(ConfigError::Validation(format!(
                    "{name} backoff multiplier must be a finite value >= 1.0"
                )));
            }
            if policy.initial_delay() > policy.max_delay() {
                return Err(ConfigError::Validation(format!(
                    "{name} initial delay must not exceed max delay"
                )));
            }
        }
        Ok(())
    }

    /// Waiting time after which a sent request is timed out.
    #[must_use]
    pub fn stale_after(&self) -> chrono::Duration {
        chrono::Duration::hours(i64::from(self.stale_after_hours))
    }

    /// Period of the stale request sweeper.
    #[must_use]
    pub const fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// Period of the metering data poller.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            key: key.to_string(),
            reason: format!("{e} (got {raw:?})"),
        }),
    }
}

fn retry_policy<F>(lookup: &F, prefix: &str, defaults: RetryPolicy) -> Result<RetryPolicy, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let max_attempts = parse_or(lookup, &format!("{prefix}_MAX_RETRIES"), defaults.max_attempts())?;
    let initial_ms = parse_or(
        lookup,
        &format!("{prefix}_INITIAL_DELAY_MS"),
        duration_ms(defaults.initial_delay()),
    )?;
    let max_ms = parse_or(lookup, &format!("{prefix}_MAX_DELAY_MS"), duration_ms(defaults.max_delay()))?;
    let multiplier = parse_or(
        lookup,
        &format!("{prefix}_BACKOFF_MULTIPLIER"),
        defaults.backoff_multiplier(),
    )?;
    Ok(defaults
        .with_max_attempts(max_attempts)
        .with_initial_delay(Duration::from_millis(initial_ms))
        .with_max_delay(Duration::from_millis(max_ms))
        .with_backoff_multiplier(multiplier))
}

#[allow(clippy::cast_possible_truncation)]
const fn duration_ms(duration: Duration) -> u64 {
    duration.as_millis() as u64
}
