//! Bounded-time execution of a single operation.
//!
//! The operation runs on its own Tokio task (or blocking-pool thread) while
//! the caller waits on it with a deadline. When the deadline fires first the
//! worker is aborted (async) or detached (blocking) and the caller gets
//! [`CallError::Timeout`]. The worker's eventual output is dropped with its
//! `JoinHandle` and can never reach a later call.
//!
//! A worker that finishes after the deadline is still a timeout: its value is
//! discarded even if the join resolved before the timer was observed.

use std::any::Any;
use std::future::Future;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;

use crate::error::CallError;

/// Runs operations under a wall-clock budget. A zero budget means unbounded.
#[derive(Debug, Clone, Copy, Default)]
pub struct BoundedExecutor;

impl BoundedExecutor {
    pub fn new() -> Self {
        Self
    }

    /// Run an async operation, failing with [`CallError::Timeout`] if it has
    /// not finished within `budget`.
    ///
    /// Both the closure and the future it returns run inside the worker task.
    /// Async workers are only cancelled at their next poll: an operation that
    /// blocks its thread keeps that thread until it yields, but its result is
    /// still reported as a timeout.
    ///
    /// With a zero budget the future is awaited inline in the caller's task,
    /// so a panic propagates to the caller instead of becoming
    /// [`CallError::Panicked`].
    pub async fn execute<F, Fut, T, E>(&self, operation: F, budget: Duration) -> Result<T, CallError<E>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        if budget.is_zero() {
            return operation().await.map_err(CallError::Operation);
        }

        let runtime = current_runtime::<E>()?;
        let deadline = Instant::now() + budget;
        let worker = runtime.spawn(async move { operation().await });
        supervise(worker, deadline, budget, |worker| worker.abort()).await
    }

    /// Run a synchronous, possibly blocking, operation on the blocking pool.
    ///
    /// A thread stuck in a system call cannot be killed safely, so on timeout
    /// the worker is detached: it keeps its pool thread until the operation
    /// returns, and whatever it returns is discarded.
    pub async fn execute_blocking<F, T, E>(&self, operation: F, budget: Duration) -> Result<T, CallError<E>>
    where
        F: FnOnce() -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        if budget.is_zero() {
            return operation().map_err(CallError::Operation);
        }

        let runtime = current_runtime::<E>()?;
        let deadline = Instant::now() + budget;
        let worker = runtime.spawn_blocking(operation);
        supervise(worker, deadline, budget, drop).await
    }
}

fn current_runtime<E>() -> Result<Handle, CallError<E>> {
    Handle::try_current().map_err(|e| CallError::Harness(format!("cannot spawn worker: {e}")))
}

async fn supervise<T, E>(
    mut worker: JoinHandle<Result<T, E>>,
    deadline: Instant,
    budget: Duration,
    reclaim: impl FnOnce(JoinHandle<Result<T, E>>),
) -> Result<T, CallError<E>> {
    match tokio::time::timeout_at(deadline, &mut worker).await {
        Ok(_) if Instant::now() > deadline => {
            tracing::debug!(budget_ms = budget.as_millis() as u64, "late worker result discarded");
            Err(CallError::Timeout { budget })
        }
        Ok(joined) => flatten(joined),
        Err(_) => {
            reclaim(worker);
            tracing::debug!(budget_ms = budget.as_millis() as u64, "worker abandoned at deadline");
            Err(CallError::Timeout { budget })
        }
    }
}

fn flatten<T, E>(joined: Result<Result<T, E>, JoinError>) -> Result<T, CallError<E>> {
    match joined {
        Ok(result) => result.map_err(CallError::Operation),
        Err(e) if e.is_panic() => Err(CallError::Panicked {
            message: panic_message(e.into_panic()),
        }),
        Err(e) => Err(CallError::Harness(format!("worker cancelled: {e}"))),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
