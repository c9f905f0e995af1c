//! Error types surfaced by guarded calls and configuration loading.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while calling through a circuit breaker.
///
/// `E` is the error type of the wrapped operation. It is carried through
/// unmodified so callers can still match on their own failure cases.
#[derive(Debug, Error)]
pub enum CallError<E> {
    /// Admission denied: the circuit is open and no fallback was supplied.
    #[error("circuit breaker '{name}' is open, request rejected")]
    CircuitOpen { name: String },

    /// The wrapped operation itself failed.
    #[error("{0}")]
    Operation(E),

    /// The operation did not complete within its budget.
    #[error("operation timed out after {} seconds", .budget.as_secs_f64())]
    Timeout { budget: Duration },

    /// The operation panicked inside its worker.
    #[error("operation panicked: {message}")]
    Panicked { message: String },

    /// The bounded execution could not be started or supervised.
    #[error("execution harness failure: {0}")]
    Harness(String),

    /// The fallback ran and failed. Never counted against the breaker.
    #[error("fallback failed: {0}")]
    Fallback(E),
}

impl<E> CallError<E> {
    /// Returns `true` if the operation exceeded its budget.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Returns `true` if the call was rejected by an open circuit.
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    /// Returns `true` for infrastructure failures of the executor itself.
    pub fn is_harness(&self) -> bool {
        matches!(self, Self::Harness(_))
    }

    /// Returns `true` if this outcome counts toward the breaker's failure count.
    pub fn counts_as_failure(&self) -> bool {
        matches!(
            self,
            Self::Operation(_) | Self::Timeout { .. } | Self::Panicked { .. }
        )
    }

    /// Extract the operation's own error. `None` for every other variant,
    /// including a failed fallback.
    pub fn into_operation(self) -> Option<E> {
        match self {
            Self::Operation(e) => Some(e),
            _ => None,
        }
    }
}

/// Errors raised while loading or validating a [`BreakerConfig`](crate::BreakerConfig).
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A threshold was zero; the breaker could never (or would always) trip.
    #[error("invalid config: {field} must be at least 1")]
    InvalidThreshold { field: &'static str },

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),
}
