//! Three-state circuit breaker: Closed → Open → Half-Open.
//!
//! State transitions:
//! - `Closed` → `Open`:      consecutive failures reach `failure_threshold`
//! - `Open` → `Half-Open`:   `reset_timeout` has elapsed since the last failure
//!                           (checked lazily at the start of the next call)
//! - `Half-Open` → `Closed`: consecutive successes reach `success_threshold`
//! - `Half-Open` → `Open`:   consecutive failures reach `failure_threshold` again
//!                           (or the first failure, with `half_open_trip_on_first_failure`)
//!
//! Each refresh/admit step and each outcome update runs under one mutex, so
//! no count or transition is lost between concurrent callers. The lock is
//! not held while the operation runs: admission is best-effort, and several
//! callers may be let through while the circuit is half-open.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;

use crate::config::BreakerConfig;
use crate::error::{CallError, ConfigError};
use crate::logging::{self, LogContext, Logger};
use crate::metrics::{MetricsCounter, MetricsSnapshot};
use crate::policy::executor::BoundedExecutor;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation.
    Closed,
    /// All requests rejected until `reset_timeout` has passed since the last failure.
    Open,
    /// Probing: requests go through, outcomes decide the next state.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Read-only view of a breaker's internals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerStatus {
    pub state: CircuitState,
    /// Consecutive failures.
    pub failure_count: u32,
    /// Consecutive successes since entering half-open.
    pub success_count: u32,
    pub since_last_failure: Option<Duration>,
    pub since_state_change: Duration,
}

struct CircuitInner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure_at: Option<Instant>,
    last_state_change: Instant,
}

struct Transition {
    from: CircuitState,
    to: CircuitState,
    failures: u32,
}

impl CircuitInner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure_at: None,
            last_state_change: Instant::now(),
        }
    }

    fn transition_to(&mut self, to: CircuitState) -> Option<Transition> {
        if self.state == to {
            return None;
        }
        let transition = Transition {
            from: self.state,
            to,
            failures: self.failure_count,
        };
        self.state = to;
        self.last_state_change = Instant::now();
        self.success_count = 0;
        if to != CircuitState::Open {
            self.failure_count = 0;
        }
        Some(transition)
    }

    /// Open → Half-Open once the reset timeout has elapsed.
    fn refresh(&mut self, reset_timeout: Duration) -> Option<Transition> {
        if self.state != CircuitState::Open {
            return None;
        }
        let last_failure = self.last_failure_at?;
        if last_failure.elapsed() >= reset_timeout {
            self.transition_to(CircuitState::HalfOpen)
        } else {
            None
        }
    }
}

/// Thread-safe circuit breaker guarding one downstream resource.
///
/// Cloning yields another handle to the same breaker: state, counters and
/// metrics are shared between clones, never between distinct breakers.
#[derive(Clone)]
pub struct CircuitBreaker {
    name: Arc<str>,
    config: Arc<BreakerConfig>,
    inner: Arc<Mutex<CircuitInner>>,
    metrics: Arc<MetricsCounter>,
    executor: BoundedExecutor,
    logger: Option<Arc<dyn Logger>>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker in `Closed` state.
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            name: Arc::from(name.into()),
            config: Arc::new(config),
            inner: Arc::new(Mutex::new(CircuitInner::new())),
            metrics: Arc::new(MetricsCounter::new()),
            executor: BoundedExecutor::new(),
            logger: None,
        })
    }

    /// Attach a logger that receives rejection, failure and state-change messages.
    pub fn with_logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Last known state. Does not apply the Open → Half-Open refresh.
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn status(&self) -> BreakerStatus {
        let inner = self.lock();
        BreakerStatus {
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            since_last_failure: inner.last_failure_at.map(|t| t.elapsed()),
            since_state_change: inner.last_state_change.elapsed(),
        }
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Run `operation` through the breaker.
    ///
    /// Fails fast with [`CallError::CircuitOpen`] while the circuit is open.
    /// Otherwise the operation runs under `operation_timeout` and its outcome
    /// updates the breaker before being returned.
    pub async fn call<F, Fut, T, E>(&self, operation: F) -> Result<T, CallError<E>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        self.admit::<E>()?;
        let outcome = self
            .executor
            .execute(operation, self.config.operation_timeout)
            .await;
        self.record(&outcome);
        outcome
    }

    /// Like [`call`](Self::call), but a rejection or failure is replaced by
    /// the fallback's outcome. The fallback is never run on success and its
    /// own failure ([`CallError::Fallback`]) is not counted. Harness failures
    /// are not absorbed.
    pub async fn call_with_fallback<F, Fut, G, GFut, T, E>(
        &self,
        operation: F,
        fallback: G,
    ) -> Result<T, CallError<E>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        G: FnOnce() -> GFut,
        GFut: Future<Output = Result<T, E>>,
        T: Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        match self.call(operation).await {
            Err(err) if !err.is_harness() => {
                tracing::debug!(breaker = %self.name, error = %err, "serving fallback");
                fallback().await.map_err(CallError::Fallback)
            }
            other => other,
        }
    }

    /// Run a synchronous operation through the breaker on the blocking pool.
    pub async fn call_blocking<F, T, E>(&self, operation: F) -> Result<T, CallError<E>>
    where
        F: FnOnce() -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        self.admit::<E>()?;
        let outcome = self
            .executor
            .execute_blocking(operation, self.config.operation_timeout)
            .await;
        self.record(&outcome);
        outcome
    }

    pub async fn call_blocking_with_fallback<F, G, T, E>(
        &self,
        operation: F,
        fallback: G,
    ) -> Result<T, CallError<E>>
    where
        F: FnOnce() -> Result<T, E> + Send + 'static,
        G: FnOnce() -> Result<T, E>,
        T: Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        match self.call_blocking(operation).await {
            Err(err) if !err.is_harness() => {
                tracing::debug!(breaker = %self.name, error = %err, "serving fallback");
                fallback().map_err(CallError::Fallback)
            }
            other => other,
        }
    }

    fn lock(&self) -> MutexGuard<'_, CircuitInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn admit<E>(&self) -> Result<(), CallError<E>> {
        let (state, transition) = {
            let mut inner = self.lock();
            let transition = inner.refresh(self.config.reset_timeout);
            (inner.state, transition)
        };
        if let Some(t) = transition {
            self.announce(t);
        }

        if state == CircuitState::Open {
            self.metrics.increment_rejections();
            tracing::warn!(breaker = %self.name, "circuit open, request rejected");
            self.log("circuit is open, request rejected", self.context());
            return Err(CallError::CircuitOpen {
                name: self.name.to_string(),
            });
        }
        Ok(())
    }

    fn record<T, E: fmt::Display>(&self, outcome: &Result<T, CallError<E>>) {
        match outcome {
            Ok(_) => self.on_success(),
            Err(err) if err.counts_as_failure() => self.on_failure(err),
            Err(err) => {
                tracing::error!(breaker = %self.name, error = %err, "guarded call could not run");
            }
        }
    }

    fn on_success(&self) {
        self.metrics.increment_successes();
        let transition = {
            let mut inner = self.lock();
            inner.failure_count = 0;
            if inner.state == CircuitState::HalfOpen {
                inner.success_count = inner.success_count.saturating_add(1);
                if inner.success_count >= self.config.success_threshold {
                    inner.transition_to(CircuitState::Closed)
                } else {
                    None
                }
            } else {
                None
            }
        };
        if let Some(t) = transition {
            self.announce(t);
        }
    }

    fn on_failure<E: fmt::Display>(&self, err: &CallError<E>) {
        if err.is_timeout() {
            self.metrics.increment_timeouts();
        }
        self.metrics.increment_failures();

        let (failures, transition) = {
            let mut inner = self.lock();
            inner.failure_count = inner.failure_count.saturating_add(1);
            inner.success_count = 0;
            inner.last_failure_at = Some(Instant::now());
            let trip = match inner.state {
                CircuitState::Closed => inner.failure_count >= self.config.failure_threshold,
                CircuitState::HalfOpen => {
                    self.config.half_open_trip_on_first_failure
                        || inner.failure_count >= self.config.failure_threshold
                }
                CircuitState::Open => false,
            };
            let failures = inner.failure_count;
            let transition = if trip {
                inner.transition_to(CircuitState::Open)
            } else {
                None
            };
            (failures, transition)
        };
        if let Some(t) = transition {
            self.announce(t);
        }

        tracing::debug!(breaker = %self.name, failures, error = %err, "guarded operation failed");
        let mut context = self.context();
        context.insert("failures".into(), Value::from(failures));
        context.insert("timeout".into(), Value::from(err.is_timeout()));
        self.log(&format!("operation failed: {err}"), context);
    }

    fn announce(&self, t: Transition) {
        match t.to {
            CircuitState::Open => {
                tracing::warn!(breaker = %self.name, from = %t.from, failures = t.failures, "circuit breaker → open");
            }
            CircuitState::HalfOpen => {
                tracing::info!(breaker = %self.name, from = %t.from, "circuit breaker → half-open");
            }
            CircuitState::Closed => {
                tracing::info!(breaker = %self.name, from = %t.from, "circuit breaker → closed");
            }
        }

        let mut context = self.context();
        context.insert("from".into(), Value::from(t.from.to_string()));
        context.insert("to".into(), Value::from(t.to.to_string()));
        context.insert("failures".into(), Value::from(t.failures));
        self.log(
            &format!("circuit state changed from {} to {}", t.from, t.to),
            context,
        );
    }

    fn context(&self) -> LogContext {
        let mut context = LogContext::new();
        context.insert("breaker".into(), Value::from(&*self.name));
        context
    }

    fn log(&self, message: &str, context: LogContext) {
        logging::deliver(self.logger.as_deref(), message, &context);
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn cb(failure_threshold: u32, success_threshold: u32) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            BreakerConfig::default()
                .with_failure_threshold(failure_threshold)
                .with_success_threshold(success_threshold)
                .with_reset_timeout(Duration::from_secs(60))
                .with_operation_timeout(Duration::from_secs(1)),
        )
        .unwrap()
    }

    async fn fail(c: &CircuitBreaker) -> CallError<String> {
        c.call(|| async { Err::<(), _>("boom".to_string()) })
            .await
            .unwrap_err()
    }

    async fn succeed(c: &CircuitBreaker) {
        c.call(|| async { Ok::<_, String>(()) }).await.unwrap();
    }

    #[tokio::test]
    async fn starts_closed() {
        let c = cb(5, 2);
        assert_eq!(c.state(), CircuitState::Closed);
        assert_eq!(c.metrics(), MetricsSnapshot::default());
        assert!(c.status().since_last_failure.is_none());
    }

    #[tokio::test]
    async fn successes_keep_circuit_closed() {
        let c = cb(2, 2);
        for _ in 0..10 {
            succeed(&c).await;
        }
        let status = c.status();
        assert_eq!(status.state, CircuitState::Closed);
        assert_eq!(status.failure_count, 0);
        assert_eq!(status.success_count, 0);
        assert_eq!(c.metrics().successes, 10);
    }

    #[tokio::test]
    async fn opens_after_threshold_failures() {
        let c = cb(3, 1);
        fail(&c).await;
        assert_eq!(c.state(), CircuitState::Closed);
        fail(&c).await;
        assert_eq!(c.state(), CircuitState::Closed);
        let err = fail(&c).await;
        assert_eq!(err.to_string(), "boom");
        assert_eq!(c.state(), CircuitState::Open);
        assert_eq!(c.metrics().failures, 3);
    }

    #[tokio::test]
    async fn success_resets_failure_count() {
        let c = cb(3, 1);
        fail(&c).await;
        fail(&c).await;
        succeed(&c).await;
        fail(&c).await;
        fail(&c).await;
        // Only 2 failures since last reset
        assert_eq!(c.state(), CircuitState::Closed);
        assert_eq!(c.status().failure_count, 2);
    }

    #[tokio::test]
    async fn open_circuit_rejects_without_running_operation() {
        let c = cb(1, 1);
        fail(&c).await;
        let before = c.status();

        let runs = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&runs);
        let err = c
            .call(move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(())
            })
            .await
            .unwrap_err();

        assert!(err.is_circuit_open());
        assert_eq!(err.to_string(), "circuit breaker 'test' is open, request rejected");
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert_eq!(c.metrics().rejections, 1);
        let after = c.status();
        assert_eq!(after.failure_count, before.failure_count);
        assert_eq!(after.success_count, before.success_count);
    }

    #[tokio::test(start_paused = true)]
    async fn state_read_does_not_refresh() {
        let c = cb(1, 1);
        fail(&c).await;
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(c.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn call_after_reset_timeout_enters_half_open() {
        let c = cb(1, 2);
        fail(&c).await;
        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(fail(&c).await.is_circuit_open());

        tokio::time::advance(Duration::from_secs(1)).await;
        succeed(&c).await;
        let status = c.status();
        assert_eq!(status.state, CircuitState::HalfOpen);
        assert_eq!(status.success_count, 1);

        succeed(&c).await;
        assert_eq!(c.state(), CircuitState::Closed);
        assert_eq!(c.status().success_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_reopens_after_threshold_failures() {
        let c = cb(2, 3);
        fail(&c).await;
        fail(&c).await;
        assert_eq!(c.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(60)).await;
        succeed(&c).await;
        assert_eq!(c.state(), CircuitState::HalfOpen);

        fail(&c).await;
        let status = c.status();
        assert_eq!(status.state, CircuitState::HalfOpen);
        assert_eq!(status.failure_count, 1);
        assert_eq!(status.success_count, 0);

        fail(&c).await;
        assert_eq!(c.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_trip_on_first_failure() {
        let c = CircuitBreaker::new(
            "strict",
            BreakerConfig::default()
                .with_failure_threshold(3)
                .with_reset_timeout(Duration::from_secs(10))
                .with_half_open_trip_on_first_failure(true),
        )
        .unwrap();
        for _ in 0..3 {
            fail(&c).await;
        }
        tokio::time::advance(Duration::from_secs(10)).await;
        fail(&c).await;
        assert_eq!(c.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn status_reports_elapsed_times() {
        let c = cb(1, 1);
        fail(&c).await;
        tokio::time::advance(Duration::from_secs(30)).await;
        let status = c.status();
        assert!(status.since_last_failure.unwrap() >= Duration::from_secs(30));
        assert!(status.since_state_change >= Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_counts_as_failure() {
        let c = cb(1, 1);
        let err = c
            .call(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, String>(())
            })
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(err.to_string().contains("timed out"));
        assert_eq!(c.state(), CircuitState::Open);
        let m = c.metrics();
        assert_eq!((m.failures, m.timeouts, m.successes), (1, 1, 0));
    }

    #[tokio::test]
    async fn late_result_from_blocked_worker_is_a_timeout() {
        let c = CircuitBreaker::new(
            "slow",
            BreakerConfig::default()
                .with_failure_threshold(1)
                .with_operation_timeout(Duration::from_millis(50)),
        )
        .unwrap();
        let err = c
            .call(|| async {
                std::thread::sleep(Duration::from_millis(300));
                Ok::<_, String>("late")
            })
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(c.state(), CircuitState::Open);
        let m = c.metrics();
        assert_eq!((m.successes, m.failures, m.timeouts), (0, 1, 1));
    }

    #[tokio::test]
    async fn panicking_operation_counts_as_failure() {
        let c = cb(1, 1);
        let err = c
            .call(|| async {
                if true {
                    panic!("handler bug");
                }
                Ok::<u8, String>(0)
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::Panicked { .. }));
        assert_eq!(c.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn fallback_replaces_failure_and_rejection() {
        let c = cb(1, 1);
        let v = c
            .call_with_fallback(
                || async { Err::<u32, _>("down".to_string()) },
                || async { Ok(99) },
            )
            .await
            .unwrap();
        assert_eq!(v, 99);
        assert_eq!(c.state(), CircuitState::Open);

        let v = c
            .call_with_fallback(|| async { Ok::<u32, String>(1) }, || async { Ok(100) })
            .await
            .unwrap();
        assert_eq!(v, 100);

        let m = c.metrics();
        assert_eq!((m.failures, m.rejections, m.successes), (1, 1, 0));
    }

    #[tokio::test]
    async fn fallback_not_invoked_on_success() {
        let c = cb(1, 1);
        let fallback_runs = AtomicU32::new(0);
        let runs = &fallback_runs;
        let v = c
            .call_with_fallback(
                || async { Ok::<u32, String>(5) },
                move || async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    Ok(0)
                },
            )
            .await
            .unwrap();
        assert_eq!(v, 5);
        assert_eq!(fallback_runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn fallback_failure_is_surfaced_and_uncounted() {
        let c = cb(5, 1);
        let err = c
            .call_with_fallback(
                || async { Err::<u32, _>("primary down".to_string()) },
                || async { Err("cache miss".to_string()) },
            )
            .await
            .unwrap_err();
        assert!(matches!(&err, CallError::Fallback(msg) if msg == "cache miss"));
        assert_eq!(c.metrics().failures, 1);
        assert_eq!(c.status().failure_count, 1);
    }

    #[test]
    fn harness_failure_is_not_counted_or_absorbed() {
        let c = cb(1, 1);
        let err = futures::executor::block_on(c.call_with_fallback(
            || async { Ok::<u8, String>(1) },
            || async { Ok(2) },
        ))
        .unwrap_err();
        assert!(err.is_harness());
        assert_eq!(c.metrics(), MetricsSnapshot::default());
        assert_eq!(c.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn blocking_calls_share_the_state_machine() {
        let c = cb(2, 1);
        let _ = c.call_blocking(|| Err::<(), _>("io".to_string())).await;
        let v = c
            .call_blocking_with_fallback(|| Err::<u8, _>("io".to_string()), || Ok(7))
            .await
            .unwrap();
        assert_eq!(v, 7);
        assert_eq!(c.state(), CircuitState::Open);
        assert!(c.call_blocking(|| Ok::<_, String>(1)).await.unwrap_err().is_circuit_open());
    }

    #[tokio::test]
    async fn clones_share_one_breaker() {
        let a = cb(2, 1);
        let b = a.clone();
        fail(&a).await;
        fail(&b).await;
        assert_eq!(a.state(), CircuitState::Open);
        assert_eq!(b.metrics().failures, 2);
    }

    #[test]
    fn invalid_config_rejected() {
        let err = CircuitBreaker::new("bad", BreakerConfig::default().with_failure_threshold(0))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidThreshold { .. }));
    }

    #[test]
    fn state_display_and_serde() {
        assert_eq!(CircuitState::HalfOpen.to_string(), "half-open");
        assert_eq!(
            serde_json::to_value(CircuitState::HalfOpen).unwrap(),
            serde_json::json!("half_open")
        );
    }
}
