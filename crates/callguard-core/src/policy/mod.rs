//! Call-guarding policies.
//!
//! Every guarded call passes through both layers:
//! ```text
//! Call → [CircuitBreaker: refresh → admit] → [BoundedExecutor: run under budget] → [CircuitBreaker: record outcome]
//! ```

pub mod circuit_breaker;
pub mod executor;

pub use circuit_breaker::{BreakerStatus, CircuitBreaker, CircuitState};
pub use executor::BoundedExecutor;
