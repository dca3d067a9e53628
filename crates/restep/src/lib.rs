//! # Restep
//!
//! A durable workflow engine built on memoized step replay.
//!
//! Workflows are plain async functions composed of named, idempotent
//! *steps*. Each step's outcome is persisted, so an execution interrupted
//! at any point can be resumed later without re-running completed work.
//!
//! ## Features
//!
//! - **Memoized replay**: completed steps return their stored output on
//!   resume instead of re-executing
//! - **Automatic retries**: per-step exponential backoff with optional jitter
//! - **Circuit breakers**: named, store-backed failure counters shared by
//!   every worker on the same database
//! - **Recoverable error handlers**: per-kind recovery closures that can run
//!   nested compensating steps
//! - **At-most-one execution**: a per-execution lock row guarantees a single
//!   concurrent run per execution id across processes
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Engine                              │
//! │     (define / start / resume / cancel, drives handlers)     │
//! └─────────────────────────────────────────────────────────────┘
//!                │                                │
//!                ▼                                ▼
//! ┌───────────────────────────┐   ┌───────────────────────────────┐
//! │        Step Runner         │   │         LockManager           │
//! │ (memoization, retry,       │   │  (per-execution exclusivity)  │
//! │  breakers, error handlers) │   └───────────────────────────────┘
//! └───────────────────────────┘
//!                │
//!                ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       WorkflowStore                          │
//! │   (definitions, executions, steps, breakers, locks:         │
//! │    PostgreSQL in production, in-memory for tests)           │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use restep::{Engine, ErrorKind, StepPolicy, WorkflowOptions};
//! use serde_json::json;
//!
//! # async fn demo() -> Result<(), restep::WorkflowError> {
//! let engine = Engine::in_memory();
//!
//! engine.define("checkout", WorkflowOptions::default(), |ctx| async move {
//!     let reserved = ctx.step("reserve", |_| async { Ok(json!("r-1")) }).await?;
//!
//!     let charged = ctx
//!         .step_with(
//!             "charge",
//!             StepPolicy::default()
//!                 .with_max_attempts(5)
//!                 .on_error(ErrorKind::ExternalService, |_err, ctx| async move {
//!                     ctx.step("charge-fallback", |_| async { Ok(json!("manual")) })
//!                         .await
//!                 }),
//!             |_| async { Ok(json!("c-1")) },
//!         )
//!         .await?;
//!
//!     Ok(json!({ "reserved": reserved, "charged": charged }))
//! });
//!
//! let output = engine.start("checkout", "order-42", json!({})).await?;
//! # let _ = output;
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod engine;
pub mod error;
pub mod hashing;
pub mod persistence;
pub mod reliability;
pub mod workflow;

/// Prelude for common imports
pub mod prelude {
    pub use crate::clock::{Clock, Delay, SystemClock, TokioDelay};
    pub use crate::engine::{CacheConfig, Engine, EngineConfig, WorkflowContext};
    pub use crate::error::{ErrorKind, WorkflowError};
    pub use crate::persistence::{
        ExecutionStatus, MemoryStore, PostgresStore, StepStatus, StoreError, WorkflowStore,
    };
    pub use crate::reliability::{CircuitBreakerPolicy, CircuitState, RetryPolicy};
    pub use crate::workflow::{StartOptions, StepPolicy, WorkflowOptions};
}

// Re-export key types at crate root
pub use clock::{Clock, Delay, ManualClock, NoopDelay, SystemClock, TokioDelay};
pub use engine::{CacheConfig, Engine, EngineConfig, LockManager, WorkflowContext};
pub use error::{ErrorKind, WorkflowError};
pub use persistence::{
    ExecutionStatus, MemoryStore, PostgresStore, StepExecution, StepStatus, StoreError,
    WorkflowDefinition, WorkflowExecution, WorkflowStore,
};
pub use reliability::{CircuitBreakerPolicy, CircuitBreakerRegistry, CircuitState, RetryPolicy};
pub use workflow::{StartOptions, StepPolicy, WorkflowOptions};
