//! Per-step execution policy
//!
//! The fluent `on_error`/`catch`/`with_circuit_breaker` surface composes
//! into a single policy record threaded through the step runner.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::engine::WorkflowContext;
use crate::error::{ErrorKind, WorkflowError};
use crate::reliability::{CircuitBreakerPolicy, RetryPolicy};

use super::RecoveryHandler;

/// Policy attached to one step invocation
///
/// All fields are optional; defaults are 3 attempts with exponential
/// backoff from 1s capped at 30s, no timeout, no circuit breaker.
///
/// # Example
///
/// ```no_run
/// use restep::{ErrorKind, StepPolicy};
/// use serde_json::json;
/// use std::time::Duration;
///
/// let policy = StepPolicy::default()
///     .with_max_attempts(5)
///     .with_backoff(Duration::from_millis(200))
///     .with_timeout(Duration::from_secs(10))
///     .on_error(ErrorKind::ExternalService, |_err, ctx| async move {
///         ctx.step("fallback", |_| async { Ok(json!("fallback")) }).await
///     });
/// ```
#[derive(Clone, Default)]
pub struct StepPolicy {
    /// Retry and backoff configuration
    pub retry: RetryPolicy,

    /// Races the step body; expiry fails the attempt with a timeout error
    pub timeout: Option<Duration>,

    /// Recorded on the step row and hashed into the step-result cache key
    pub input: Option<Value>,

    /// Gate the body behind a named circuit breaker
    pub circuit_breaker: Option<CircuitBreakerPolicy>,

    pub(crate) error_handlers: HashMap<ErrorKind, RecoveryHandler>,
    pub(crate) catch_all: Option<RecoveryHandler>,
}

impl StepPolicy {
    /// Replace the whole retry policy
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the maximum number of attempts
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.retry = self.retry.with_max_attempts(max_attempts);
        self
    }

    /// Set the base backoff delay
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.retry = self.retry.with_backoff(backoff);
        self
    }

    /// Set the step timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Attach an input payload, persisted on the step row
    pub fn with_input(mut self, input: Value) -> Self {
        self.input = Some(input);
        self
    }

    /// Gate the step behind a circuit breaker
    pub fn with_circuit_breaker(mut self, breaker: CircuitBreakerPolicy) -> Self {
        self.circuit_breaker = Some(breaker);
        self
    }

    /// Register a recovery handler for one error kind
    ///
    /// The handler may issue nested steps through the context. A returned
    /// value completes the step; a returned error escalates.
    pub fn on_error<F, Fut>(mut self, kind: ErrorKind, handler: F) -> Self
    where
        F: Fn(WorkflowError, WorkflowContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, WorkflowError>> + Send + 'static,
    {
        self.error_handlers
            .insert(kind, Arc::new(move |err, ctx| Box::pin(handler(err, ctx))));
        self
    }

    /// Register a catch-all recovery handler, consulted after named handlers
    pub fn catch<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(WorkflowError, WorkflowContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, WorkflowError>> + Send + 'static,
    {
        self.catch_all = Some(Arc::new(move |err, ctx| Box::pin(handler(err, ctx))));
        self
    }

    /// Resolve the recovery handler for an error, named first then catch-all
    pub(crate) fn handler_for(&self, kind: ErrorKind) -> Option<RecoveryHandler> {
        self.error_handlers
            .get(&kind)
            .cloned()
            .or_else(|| self.catch_all.clone())
    }
}

impl fmt::Debug for StepPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepPolicy")
            .field("retry", &self.retry)
            .field("timeout", &self.timeout)
            .field("input", &self.input)
            .field("circuit_breaker", &self.circuit_breaker)
            .field(
                "error_handlers",
                &self.error_handlers.keys().collect::<Vec<_>>(),
            )
            .field("catch_all", &self.catch_all.as_ref().map(|_| "<fn>"))
            .finish()
    }
}
