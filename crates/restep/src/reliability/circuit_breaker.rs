//! Store-backed circuit breakers
//!
//! Breaker state is shared across processes via the workflow store, keyed by
//! name, so every worker sees the same failure counts. The per-call policy
//! (threshold, reset timeout, open-circuit fallback) travels with the step
//! invocation, not with the stored state.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::persistence::{CircuitPatch, StoreError, WorkflowStore};
use crate::workflow::OnOpenHook;

/// Circuit breaker states
///
/// # State Machine
///
/// ```text
/// ┌─────────┐  failure threshold  ┌─────────┐  reset timeout  ┌──────────┐
/// │ Closed  │ ─────────────────► │  Open   │ ──────────────► │ HalfOpen │
/// └─────────┘                     └─────────┘                 └──────────┘
///      ▲                               ▲                           │
///      │            success            │         failure           │
///      └───────────────────────────────┴───────────────────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation - all calls allowed
    Closed,

    /// Failure threshold exceeded - calls rejected until the reset timeout
    Open,

    /// Testing if the dependency recovered - the next call is admitted
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CircuitState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "closed" => Ok(Self::Closed),
            "open" => Ok(Self::Open),
            "half_open" => Ok(Self::HalfOpen),
            other => Err(format!("unknown circuit state: {other}")),
        }
    }
}

/// Whether a gated call may proceed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitDecision {
    Allow,
    Reject,
}

/// Per-invocation circuit breaker policy
///
/// Attached to a step via [`StepPolicy::with_circuit_breaker`]. Without an
/// explicit name the breaker is keyed by the step name.
///
/// [`StepPolicy::with_circuit_breaker`]: crate::StepPolicy::with_circuit_breaker
///
/// # Example
///
/// ```
/// use restep::CircuitBreakerPolicy;
/// use std::time::Duration;
///
/// let policy = CircuitBreakerPolicy::named("billing-api")
///     .with_failure_threshold(3)
///     .with_reset_timeout(Duration::from_secs(30));
/// ```
#[derive(Clone)]
pub struct CircuitBreakerPolicy {
    /// Breaker key; defaults to the step name when absent
    pub name: Option<String>,

    /// Consecutive failures required to open the circuit
    pub failure_threshold: u32,

    /// Time to wait in open state before admitting a half-open probe
    pub reset_timeout: Duration,

    /// Fallback invoked as a nested step when the circuit rejects a call
    pub on_open: Option<OnOpenHook>,
}

impl Default for CircuitBreakerPolicy {
    fn default() -> Self {
        Self {
            name: None,
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
            on_open: None,
        }
    }
}

impl CircuitBreakerPolicy {
    /// Create a policy keyed by an explicit breaker name
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    /// Set the failure threshold to open the circuit
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    /// Set the reset timeout (time before admitting a probe after opening)
    pub fn with_reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = timeout;
        self
    }

    /// Provide a fallback run as a nested step when the circuit is open
    pub fn on_open<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(crate::WorkflowContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<serde_json::Value, crate::WorkflowError>>
            + Send
            + 'static,
    {
        self.on_open = Some(Arc::new(move |ctx| Box::pin(hook(ctx))));
        self
    }

    /// Resolve the breaker key for a step
    pub fn key_for_step(&self, step_name: &str) -> String {
        self.name.clone().unwrap_or_else(|| step_name.to_string())
    }
}

impl fmt::Debug for CircuitBreakerPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreakerPolicy")
            .field("name", &self.name)
            .field("failure_threshold", &self.failure_threshold)
            .field("reset_timeout", &self.reset_timeout)
            .field("on_open", &self.on_open.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

/// Registry driving the breaker state machine against the store
///
/// All transitions are persisted, so breaker windows survive process
/// restarts and are visible to every worker sharing the store.
pub struct CircuitBreakerRegistry {
    store: Arc<dyn WorkflowStore>,
    clock: Arc<dyn Clock>,
}

impl CircuitBreakerRegistry {
    pub fn new(store: Arc<dyn WorkflowStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Gate a call through the breaker named `name`
    ///
    /// Open with the reset timeout still pending rejects; open with the
    /// timeout elapsed transitions to half-open and admits the probe.
    pub async fn before_call(
        &self,
        name: &str,
        _policy: &CircuitBreakerPolicy,
    ) -> Result<CircuitDecision, StoreError> {
        let state = self.store.circuit_get_or_create(name).await?;

        match state.state {
            CircuitState::Closed | CircuitState::HalfOpen => Ok(CircuitDecision::Allow),
            CircuitState::Open => {
                let now = self.clock.now();
                let ready = state.next_attempt_at.map(|t| now >= t).unwrap_or(true);

                if ready {
                    self.store
                        .update_circuit(
                            name,
                            CircuitPatch {
                                state: CircuitState::HalfOpen,
                                failure_count: state.failure_count,
                                last_failure_at: state.last_failure_at,
                                next_attempt_at: state.next_attempt_at,
                            },
                        )
                        .await?;
                    tracing::debug!(breaker = name, "circuit half-open, admitting probe");
                    Ok(CircuitDecision::Allow)
                } else {
                    Ok(CircuitDecision::Reject)
                }
            }
        }
    }

    /// Record a successful call: close the circuit and clear counters
    pub async fn on_success(&self, name: &str) -> Result<(), StoreError> {
        self.store
            .update_circuit(
                name,
                CircuitPatch {
                    state: CircuitState::Closed,
                    failure_count: 0,
                    last_failure_at: None,
                    next_attempt_at: None,
                },
            )
            .await?;
        Ok(())
    }

    /// Record a failed call
    ///
    /// Opens the circuit when the threshold is reached, or immediately when
    /// the probe failed in half-open state.
    pub async fn on_failure(
        &self,
        name: &str,
        policy: &CircuitBreakerPolicy,
    ) -> Result<(), StoreError> {
        let state = self.store.circuit_get_or_create(name).await?;
        let now = self.clock.now();
        let failure_count = state.failure_count + 1;

        let should_open = failure_count >= policy.failure_threshold
            || state.state == CircuitState::HalfOpen;

        let patch = if should_open {
            let next_attempt_at =
                now + chrono::Duration::milliseconds(policy.reset_timeout.as_millis() as i64);
            tracing::warn!(
                breaker = name,
                failure_count,
                "circuit opened until {next_attempt_at}"
            );
            CircuitPatch {
                state: CircuitState::Open,
                failure_count,
                last_failure_at: Some(now),
                next_attempt_at: Some(next_attempt_at),
            }
        } else {
            CircuitPatch {
                state: state.state,
                failure_count,
                last_failure_at: Some(now),
                next_attempt_at: state.next_attempt_at,
            }
        };

        self.store.update_circuit(name, patch).await?;
        Ok(())
    }

    /// Force a breaker back to closed (admin/test operation)
    pub async fn reset(&self, name: &str) -> Result<(), StoreError> {
        self.store.reset_circuit(name).await?;
        Ok(())
    }

    /// Current state without gating a call
    pub async fn state(&self, name: &str) -> Result<CircuitState, StoreError> {
        Ok(self.store.circuit_get_or_create(name).await?.state)
    }
}
