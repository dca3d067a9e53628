//! Step runner: memoization, retry, error-handler chaining, breaker gating
//!
//! One call = one step row. The row is the authoritative memo: a completed
//! row short-circuits the body, a failed row with attempts remaining is
//! reused across resumes, anything else starts a fresh row.

use std::time::Duration;

use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::engine::cache::CacheKey;
use crate::error::WorkflowError;
use crate::hashing::hash_input;
use crate::persistence::{ExecutionStatus, NewStep, StepPatch, StepStatus};
use crate::reliability::CircuitDecision;
use crate::workflow::{StepBody, StepPolicy};

use super::context::WorkflowContext;
use super::engine::EngineShared;

pub(crate) fn run_step<'a>(
    ctx: &'a WorkflowContext,
    name: &'a str,
    policy: StepPolicy,
    body: StepBody,
) -> futures::future::BoxFuture<'a, Result<Value, WorkflowError>> {
    Box::pin(run_step_inner(ctx, name, policy, body))
}

async fn run_step_inner(
    ctx: &WorkflowContext,
    name: &str,
    policy: StepPolicy,
    body: StepBody,
) -> Result<Value, WorkflowError> {
    let shared = &ctx.shared;

    // Cancellation is cooperative: every step call re-checks the execution
    let execution = shared
        .store
        .execution_by_id(&ctx.execution_id)
        .await?
        .ok_or_else(|| WorkflowError::ExecutionNotFound {
            execution_id: ctx.execution_id.clone(),
        })?;
    if execution.status == ExecutionStatus::Cancelled {
        return Err(WorkflowError::Cancelled {
            execution_id: ctx.execution_id.clone(),
        });
    }

    let cache_key = CacheKey {
        execution_id: ctx.execution_id.clone(),
        step_name: name.to_string(),
        input_hash: hash_input(policy.input.as_ref()),
    };
    if let Some(value) = shared.cache.get(&cache_key) {
        debug!(step = name, "step replayed from cache");
        return Ok(value);
    }

    // Memoized replay: the most recent row for this step name decides
    let existing = shared
        .store
        .step_by_execution_and_name(&ctx.execution_id, name)
        .await?;

    let (row_id, start_attempt, max_attempts) = match existing {
        Some(step) if step.status == StepStatus::Completed => {
            let output = step.output.unwrap_or(Value::Null);
            shared.cache.insert(cache_key, output.clone());
            debug!(step = name, "step replayed from store");
            return Ok(output);
        }
        Some(step) if step.is_retryable() => {
            let next_attempt = step.attempt + 1;
            shared
                .store
                .update_step(
                    step.id,
                    StepPatch {
                        status: Some(StepStatus::Running),
                        attempt: Some(next_attempt),
                        ..Default::default()
                    },
                )
                .await?;
            (step.id, next_attempt, step.max_attempts)
        }
        _ => {
            let max_attempts = policy.retry.max_attempts.max(1);
            let created = shared
                .store
                .create_step(NewStep {
                    id: Uuid::now_v7(),
                    execution_id: ctx.execution_id.clone(),
                    step_name: name.to_string(),
                    status: StepStatus::Running,
                    input: policy.input.clone(),
                    attempt: 1,
                    max_attempts,
                    started_at: Some(shared.clock.now()),
                })
                .await?;
            (created.id, 1, max_attempts)
        }
    };

    let mut attempt = start_attempt;
    loop {
        // Circuit breaker gating comes before the body on every attempt
        if let Some(breaker) = policy.circuit_breaker.as_ref() {
            let breaker_name = breaker.key_for_step(name);
            if shared.breakers.before_call(&breaker_name, breaker).await?
                == CircuitDecision::Reject
            {
                if let Some(hook) = breaker.on_open.clone() {
                    let hook_name = format!("{name}:onOpen");
                    debug!(step = name, breaker = %breaker_name, "circuit open, running fallback");
                    // Boxed: the hook runs as a nested step through this
                    // same function
                    let value = run_step(ctx, &hook_name, StepPolicy::default(), hook).await?;
                    complete_step(shared, row_id, &cache_key, value.clone()).await?;
                    return Ok(value);
                }

                let err = WorkflowError::CircuitOpen {
                    name: breaker_name,
                };
                // The body never ran; fail the row without consuming attempts
                shared
                    .store
                    .update_step(
                        row_id,
                        StepPatch {
                            status: Some(StepStatus::Failed),
                            error: Some(err.to_value()),
                            completed_at: Some(shared.clock.now()),
                            ..Default::default()
                        },
                    )
                    .await?;
                return Err(err);
            }
        }

        match invoke_body(ctx, &body, policy.timeout).await {
            Ok(value) => {
                if let Some(breaker) = policy.circuit_breaker.as_ref() {
                    shared
                        .breakers
                        .on_success(&breaker.key_for_step(name))
                        .await?;
                }
                complete_step(shared, row_id, &cache_key, value.clone()).await?;
                return Ok(value);
            }
            Err(body_err) => {
                let mut err = body_err;

                // Recovery: named handler first, then catch-all. A returned
                // value completes the step; a returned error escalates.
                if let Some(handler) = policy.handler_for(err.kind()) {
                    shared
                        .store
                        .update_step(
                            row_id,
                            StepPatch {
                                status: Some(StepStatus::Retrying),
                                ..Default::default()
                            },
                        )
                        .await?;

                    match handler(err.clone(), ctx.clone()).await {
                        Ok(value) => {
                            debug!(step = name, "error handler recovered");
                            complete_step(shared, row_id, &cache_key, value.clone()).await?;
                            return Ok(value);
                        }
                        Err(rethrown) => err = rethrown,
                    }
                }

                if let Some(breaker) = policy.circuit_breaker.as_ref() {
                    shared
                        .breakers
                        .on_failure(&breaker.key_for_step(name), breaker)
                        .await?;
                }

                if attempt < max_attempts {
                    shared
                        .store
                        .update_step(
                            row_id,
                            StepPatch {
                                status: Some(StepStatus::Failed),
                                attempt: Some(attempt),
                                error: Some(err.to_value()),
                                ..Default::default()
                            },
                        )
                        .await?;

                    let backoff = policy.retry.backoff_for_attempt(attempt);
                    debug!(step = name, attempt, ?backoff, "step failed, backing off");
                    shared.delay.sleep(backoff).await;

                    attempt += 1;
                    shared
                        .store
                        .update_step(
                            row_id,
                            StepPatch {
                                status: Some(StepStatus::Retrying),
                                attempt: Some(attempt),
                                ..Default::default()
                            },
                        )
                        .await?;
                    continue;
                }

                shared
                    .store
                    .update_step(
                        row_id,
                        StepPatch {
                            status: Some(StepStatus::Failed),
                            attempt: Some(attempt),
                            error: Some(err.to_value()),
                            completed_at: Some(shared.clock.now()),
                            ..Default::default()
                        },
                    )
                    .await?;
                warn!(step = name, attempt, "step exhausted retries: {err}");
                return Err(err);
            }
        }
    }
}

async fn complete_step(
    shared: &EngineShared,
    row_id: Uuid,
    cache_key: &CacheKey,
    value: Value,
) -> Result<(), WorkflowError> {
    shared
        .store
        .update_step(
            row_id,
            StepPatch {
                status: Some(StepStatus::Completed),
                output: Some(value.clone()),
                completed_at: Some(shared.clock.now()),
                ..Default::default()
            },
        )
        .await?;
    shared.cache.insert(cache_key.clone(), value);
    Ok(())
}

async fn invoke_body(
    ctx: &WorkflowContext,
    body: &StepBody,
    timeout: Option<Duration>,
) -> Result<Value, WorkflowError> {
    let fut = body(ctx.clone());
    match timeout {
        None => fut.await,
        Some(limit) => {
            tokio::select! {
                result = fut => result,
                _ = ctx.shared.delay.sleep(limit) => Err(WorkflowError::Timeout {
                    timeout_ms: limit.as_millis() as u64,
                }),
            }
        }
    }
}
