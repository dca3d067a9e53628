//! Workflow execution context
//!
//! The context is the handler's only channel for durable work: every side
//! effect belongs inside a `step` so it is memoized and skipped on resume.

use std::future::Future;
use std::time::Duration;

use serde_json::{json, Value};

use crate::error::WorkflowError;
use crate::workflow::{StepBody, StepPolicy};

use super::engine::SharedHandle;
use super::runner;

/// Context passed to workflow handlers and step bodies
///
/// Cheap to clone; step bodies and recovery handlers receive their own
/// clone for issuing nested steps. Within one execution, `step` calls run
/// strictly sequentially (the execution lock serializes the whole run).
///
/// # Example
///
/// ```ignore
/// engine.define("order", WorkflowOptions::default(), |ctx| async move {
///     let reserved = ctx.step("reserve", |_| async { reserve().await }).await?;
///     ctx.sleep("settle-delay", Duration::from_secs(5)).await?;
///     let charged = ctx.step("charge", |_| async { charge().await }).await?;
///     Ok(json!({ "reserved": reserved, "charged": charged }))
/// });
/// ```
#[derive(Clone)]
pub struct WorkflowContext {
    pub(crate) shared: SharedHandle,

    /// Caller-supplied execution id
    pub execution_id: String,

    /// Name the handler was registered under
    pub workflow_name: String,

    /// Input passed to `start`
    pub input: Value,

    /// Workflow-level attempt (1-based), not step-level
    pub attempt: u32,

    /// Execution metadata, if any
    pub metadata: Option<Value>,
}

impl WorkflowContext {
    /// Run a named step with the default policy
    ///
    /// If a completed row exists for this step name, the stored output is
    /// returned and `body` is not invoked.
    pub async fn step<F, Fut>(&self, name: &str, body: F) -> Result<Value, WorkflowError>
    where
        F: Fn(WorkflowContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, WorkflowError>> + Send + 'static,
    {
        self.step_with(name, StepPolicy::default(), body).await
    }

    /// Run a named step with an explicit policy
    pub async fn step_with<F, Fut>(
        &self,
        name: &str,
        policy: StepPolicy,
        body: F,
    ) -> Result<Value, WorkflowError>
    where
        F: Fn(WorkflowContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, WorkflowError>> + Send + 'static,
    {
        let body: StepBody = std::sync::Arc::new(move |ctx| Box::pin(body(ctx)));
        runner::run_step(self, name, policy, body).await
    }

    /// Durable sleep: a step whose body is a delay
    ///
    /// On replay the completed row short-circuits and the call returns
    /// immediately.
    pub async fn sleep(&self, name: &str, duration: Duration) -> Result<(), WorkflowError> {
        let delay = self.shared.delay.clone();
        let policy = StepPolicy::default()
            .with_max_attempts(1)
            .with_input(json!({ "sleep_ms": duration.as_millis() as u64 }));

        self.step_with(name, policy, move |_ctx| {
            let delay = delay.clone();
            async move {
                delay.sleep(duration).await;
                Ok(Value::Null)
            }
        })
        .await?;

        Ok(())
    }
}
