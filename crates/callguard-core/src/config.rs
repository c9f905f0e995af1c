//! Breaker configuration: two thresholds and two durations.
//!
//! Durations are written as (fractional) seconds in YAML/JSON:
//!
//! ```yaml
//! failure_threshold: 3
//! success_threshold: 2
//! reset_timeout: 5
//! operation_timeout: 0.5
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Immutable thresholds supplied to a [`CircuitBreaker`](crate::CircuitBreaker) at construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures before the circuit opens.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Consecutive half-open successes before the circuit closes.
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
    /// Time since the last failure after which an open circuit admits a trial call.
    #[serde(default = "default_reset_timeout", with = "duration_secs")]
    pub reset_timeout: Duration,
    /// Wall-clock budget per operation. Zero means unbounded.
    #[serde(default = "default_operation_timeout", with = "duration_secs")]
    pub operation_timeout: Duration,
    /// Reopen on the first failure seen while half-open instead of waiting
    /// for `failure_threshold` consecutive failures.
    #[serde(default)]
    pub half_open_trip_on_first_failure: bool,
}

fn default_failure_threshold() -> u32 { 5 }
fn default_success_threshold() -> u32 { 2 }
fn default_reset_timeout() -> Duration { Duration::from_secs(30) }
fn default_operation_timeout() -> Duration { Duration::from_secs(5) }

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            reset_timeout: default_reset_timeout(),
            operation_timeout: default_operation_timeout(),
            half_open_trip_on_first_failure: false,
        }
    }
}

impl BreakerConfig {
    /// Parse and validate a config from YAML. Missing fields take defaults.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate a config from JSON. Missing fields take defaults.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Semantic checks serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::InvalidThreshold { field: "failure_threshold" });
        }
        if self.success_threshold == 0 {
            return Err(ConfigError::InvalidThreshold { field: "success_threshold" });
        }
        Ok(())
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold;
        self
    }

    pub fn with_reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = timeout;
        self
    }

    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    pub fn with_half_open_trip_on_first_failure(mut self, enabled: bool) -> Self {
        self.half_open_trip_on_first_failure = enabled;
        self
    }
}

/// `Duration` <-> fractional seconds.
mod duration_secs {
    use std::time::Duration;

    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs)
            .map_err(|e| de::Error::custom(format!("invalid duration {secs}: {e}")))
    }
}
