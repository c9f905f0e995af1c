//! callguard-core — circuit breaking and bounded-time execution for calls
//! into unreliable dependencies.
//!
//! # Overview
//!
//! Wrap every call to a remote service, database or child process in a
//! [`CircuitBreaker`]. The breaker tracks consecutive failures, sheds load
//! while the dependency looks unhealthy, and runs each admitted operation
//! under a hard wall-clock budget through the [`BoundedExecutor`].
//!
//! - [`policy`] module — breaker state machine and bounded executor
//! - [`CallError`] — failure taxonomy surfaced to callers
//! - [`BreakerConfig`] — thresholds and durations
//! - [`MetricsCounter`] / [`MetricsSnapshot`] — per-breaker event counters
//! - [`Logger`] — pluggable sink for human-readable breaker messages
//!
//! ```no_run
//! use callguard_core::{BreakerConfig, CircuitBreaker};
//!
//! # async fn demo() {
//! let breaker = CircuitBreaker::new("billing-api", BreakerConfig::default()).unwrap();
//! let result = breaker
//!     .call_with_fallback(
//!         || async { Err::<u32, String>("connection refused".into()) },
//!         || async { Ok(0) },
//!     )
//!     .await;
//! assert_eq!(result.unwrap(), 0);
//! # }
//! ```

pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod policy;

pub use config::BreakerConfig;
pub use error::{CallError, ConfigError};
pub use logging::{init_tracing, LogConfig, LogContext, LogFormat, Logger, TracingLogger};
pub use metrics::{MetricsCounter, MetricsSnapshot};
pub use policy::{BoundedExecutor, BreakerStatus, CircuitBreaker, CircuitState};
