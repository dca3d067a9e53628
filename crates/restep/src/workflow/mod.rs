//! Workflow-facing types: handlers, registration options, step policies

mod options;
mod policy;

use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;

use crate::engine::WorkflowContext;
use crate::error::WorkflowError;

pub use options::{StartOptions, WorkflowOptions};
pub use policy::StepPolicy;

/// Future returned by handlers, step bodies, and recovery handlers
pub type HandlerFuture = BoxFuture<'static, Result<Value, WorkflowError>>;

/// A registered workflow handler
///
/// Handlers must be deterministic with respect to their input and the
/// outputs of their `ctx.step` calls: on resume the handler re-runs from the
/// top and completed steps replay their stored outputs verbatim. Wrap every
/// side effect in a step.
pub type WorkflowHandler = Arc<dyn Fn(WorkflowContext) -> HandlerFuture + Send + Sync>;

/// A step body; invoked once per attempt
pub type StepBody = Arc<dyn Fn(WorkflowContext) -> HandlerFuture + Send + Sync>;

/// Recovery handler dispatched by error kind
///
/// Receives the step's error and a context for issuing nested compensating
/// steps. Returning a value completes the step with that value; returning an
/// error escalates it.
pub type RecoveryHandler = Arc<dyn Fn(WorkflowError, WorkflowContext) -> HandlerFuture + Send + Sync>;

/// Fallback invoked as a nested step when a circuit breaker rejects a call
pub type OnOpenHook = Arc<dyn Fn(WorkflowContext) -> HandlerFuture + Send + Sync>;
