//! Workflow engine: public surface and per-execution lifecycle

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{Map, Value};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::clock::{Clock, Delay, SystemClock, TokioDelay};
use crate::error::{ErrorKind, WorkflowError};
use crate::persistence::{
    boxed_tx, DefinitionPatch, ExecutionPatch, ExecutionStatus, MemoryStore, NewExecution,
    StepExecution, StoreError, WorkflowDefinition, WorkflowExecution, WorkflowStore,
};
use crate::reliability::{CircuitBreakerRegistry, RetryPolicy};
use crate::workflow::{StartOptions, WorkflowHandler, WorkflowOptions};

use super::cache::{CacheConfig, StepResultCache};
use super::context::WorkflowContext;
use super::lock::{LockManager, DEFAULT_LOCK_TTL};
use super::registry::{HandlerRegistry, RegisteredWorkflow};

/// Engine tuning knobs
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Lifetime of execution locks before a crashed holder is reclaimable
    pub lock_ttl: Duration,

    /// Step-result cache sizing
    pub cache: CacheConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lock_ttl: DEFAULT_LOCK_TTL,
            cache: CacheConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }
}

/// Collaborators shared by the engine, contexts, and the step runner
pub(crate) struct EngineShared {
    pub(crate) store: Arc<dyn WorkflowStore>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) delay: Arc<dyn Delay>,
    pub(crate) registry: HandlerRegistry,
    pub(crate) breakers: CircuitBreakerRegistry,
    pub(crate) locks: LockManager,
    pub(crate) cache: StepResultCache,
}

pub(crate) type SharedHandle = Arc<EngineShared>;

/// Durable workflow engine
///
/// Executes registered handlers composed of named, idempotent steps. Step
/// outcomes are persisted, so an interrupted execution can be resumed
/// without re-running completed work.
///
/// Handlers must be deterministic with respect to their input and the
/// outputs of their `ctx.step` calls: on resume the handler re-runs from
/// the top and completed steps replay their stored outputs.
///
/// # Example
///
/// ```no_run
/// use restep::{Engine, WorkflowOptions};
/// use serde_json::json;
///
/// # async fn demo() -> Result<(), restep::WorkflowError> {
/// let engine = Engine::in_memory();
///
/// engine.define("greet", WorkflowOptions::default(), |ctx| async move {
///     let who = ctx.step("lookup", |_| async { Ok(json!("world")) }).await?;
///     Ok(json!(format!("hello {}", who.as_str().unwrap_or("?"))))
/// });
///
/// let output = engine.start("greet", "greet-1", json!({})).await?;
/// assert_eq!(output, json!("hello world"));
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Engine {
    shared: SharedHandle,
}

impl Engine {
    /// Create an engine over a store with default collaborators
    pub fn new(store: Arc<dyn WorkflowStore>) -> Self {
        Self::with_collaborators(
            store,
            Arc::new(SystemClock),
            Arc::new(TokioDelay),
            EngineConfig::default(),
        )
    }

    /// Create an engine with custom config
    pub fn with_config(store: Arc<dyn WorkflowStore>, config: EngineConfig) -> Self {
        Self::with_collaborators(store, Arc::new(SystemClock), Arc::new(TokioDelay), config)
    }

    /// Create an engine with every collaborator injected (tests)
    pub fn with_collaborators(
        store: Arc<dyn WorkflowStore>,
        clock: Arc<dyn Clock>,
        delay: Arc<dyn Delay>,
        config: EngineConfig,
    ) -> Self {
        let breakers = CircuitBreakerRegistry::new(store.clone(), clock.clone());
        let locks = LockManager::new(store.clone(), clock.clone()).with_ttl(config.lock_ttl);
        let cache = StepResultCache::new(config.cache.clone(), clock.clone());

        Self {
            shared: Arc::new(EngineShared {
                store,
                clock,
                delay,
                registry: HandlerRegistry::new(),
                breakers,
                locks,
                cache,
            }),
        }
    }

    /// Engine over a fresh in-memory store, for tests and embedders
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    /// The underlying store
    pub fn store(&self) -> Arc<dyn WorkflowStore> {
        self.shared.store.clone()
    }

    /// Registered workflow names
    pub fn workflows(&self) -> Vec<String> {
        self.shared.registry.names()
    }

    /// Register a workflow handler
    ///
    /// The handler lands in the in-process registry immediately; the
    /// definition row is upserted in the background (and again,
    /// synchronously, on the first `start`). Must be called from within a
    /// tokio runtime.
    pub fn define<F, Fut>(&self, name: &str, options: WorkflowOptions, handler: F)
    where
        F: Fn(WorkflowContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, WorkflowError>> + Send + 'static,
    {
        let handler: WorkflowHandler = Arc::new(move |ctx| Box::pin(handler(ctx)));
        info!(workflow = name, version = %options.version, "registered workflow");
        self.shared.registry.register(name, handler, options);

        let shared = self.shared.clone();
        let name = name.to_string();
        tokio::spawn(async move {
            // Re-read the registry so a stale task cannot roll back a newer
            // registration of the same name
            let Some(current) = shared.registry.get(&name) else {
                return;
            };
            if let Err(err) = ensure_definition(&shared, &name, &current.options).await {
                warn!(workflow = %name, "definition upsert failed: {err}");
            }
        });
    }

    /// Start an execution and run it to completion
    pub async fn start(
        &self,
        name: &str,
        execution_id: &str,
        input: Value,
    ) -> Result<Value, WorkflowError> {
        self.start_with(name, execution_id, input, StartOptions::default())
            .await
    }

    /// Start an execution with caller metadata
    #[instrument(skip_all, fields(workflow = name, execution_id))]
    pub async fn start_with(
        &self,
        name: &str,
        execution_id: &str,
        input: Value,
        options: StartOptions,
    ) -> Result<Value, WorkflowError> {
        let registered =
            self.shared
                .registry
                .get(name)
                .ok_or_else(|| WorkflowError::UnknownWorkflow {
                    name: name.to_string(),
                })?;

        // The execution row references the definition, so the definition
        // must exist before the execution does
        let definition = ensure_definition(&self.shared, name, &registered.options).await?;

        let execution = match self.shared.store.execution_by_id(execution_id).await? {
            Some(_) => {
                self.shared
                    .store
                    .update_execution(
                        execution_id,
                        ExecutionPatch {
                            status: Some(ExecutionStatus::Pending),
                            input: Some(input),
                            metadata: options.metadata,
                            ..Default::default()
                        },
                    )
                    .await?
            }
            None => {
                self.shared
                    .store
                    .create_execution(NewExecution {
                        id: execution_id.to_string(),
                        definition_id: definition.id,
                        workflow_name: name.to_string(),
                        status: ExecutionStatus::Pending,
                        input: Some(input),
                        metadata: options.metadata,
                    })
                    .await?
            }
        };

        self.run_locked(registered, execution).await
    }

    /// Re-enter a `running`, `paused`, or `failed` execution
    ///
    /// The handler re-runs from the top; completed steps replay their
    /// stored outputs without invoking their bodies.
    #[instrument(skip(self))]
    pub async fn resume(&self, execution_id: &str) -> Result<Value, WorkflowError> {
        let execution = self
            .shared
            .store
            .execution_by_id(execution_id)
            .await?
            .ok_or_else(|| WorkflowError::ExecutionNotFound {
                execution_id: execution_id.to_string(),
            })?;

        if !execution.status.is_resumable() {
            return Err(WorkflowError::NotResumable {
                execution_id: execution_id.to_string(),
                status: execution.status.to_string(),
            });
        }

        let registered = self
            .shared
            .registry
            .get(&execution.workflow_name)
            .ok_or_else(|| WorkflowError::UnknownWorkflow {
                name: execution.workflow_name.clone(),
            })?;

        self.run_locked(registered, execution).await
    }

    /// Cancel an execution; subsequent step calls refuse with `cancelled`
    ///
    /// Cooperative: an in-flight step body is not interrupted.
    pub async fn cancel(&self, execution_id: &str) -> Result<(), WorkflowError> {
        self.set_status(execution_id, ExecutionStatus::Cancelled)
            .await?;
        info!(execution_id, "execution cancelled");
        Ok(())
    }

    /// Park a running execution; `resume` picks it back up
    pub async fn pause(&self, execution_id: &str) -> Result<(), WorkflowError> {
        self.set_status(execution_id, ExecutionStatus::Paused)
            .await?;
        info!(execution_id, "execution paused");
        Ok(())
    }

    /// Executions still marked running, oldest first (crash-recovery sweeps)
    pub async fn resumable(&self) -> Result<Vec<WorkflowExecution>, WorkflowError> {
        Ok(self.shared.store.resumable_executions().await?)
    }

    /// Executions for a workflow in a status, newest first
    pub async fn executions(
        &self,
        workflow_name: &str,
        status: ExecutionStatus,
    ) -> Result<Vec<WorkflowExecution>, WorkflowError> {
        Ok(self
            .shared
            .store
            .executions_by_name_and_status(workflow_name, status)
            .await?)
    }

    /// Fetch one execution
    pub async fn execution(
        &self,
        execution_id: &str,
    ) -> Result<Option<WorkflowExecution>, WorkflowError> {
        Ok(self.shared.store.execution_by_id(execution_id).await?)
    }

    /// Step rows of an execution in program order
    pub async fn steps(&self, execution_id: &str) -> Result<Vec<StepExecution>, WorkflowError> {
        Ok(self.shared.store.steps_by_execution(execution_id).await?)
    }

    async fn set_status(
        &self,
        execution_id: &str,
        status: ExecutionStatus,
    ) -> Result<(), WorkflowError> {
        if self
            .shared
            .store
            .execution_by_id(execution_id)
            .await?
            .is_none()
        {
            return Err(WorkflowError::ExecutionNotFound {
                execution_id: execution_id.to_string(),
            });
        }

        self.shared
            .store
            .update_execution(
                execution_id,
                ExecutionPatch {
                    status: Some(status),
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }

    /// Acquire the execution lock, drive the handler, always release
    async fn run_locked(
        &self,
        registered: Arc<RegisteredWorkflow>,
        execution: WorkflowExecution,
    ) -> Result<Value, WorkflowError> {
        let lock_key = format!("{}:{}", execution.workflow_name, execution.id);
        if !self.shared.locks.acquire(&execution.id, &lock_key).await? {
            return Err(WorkflowError::AlreadyRunning {
                execution_id: execution.id,
            });
        }

        let result = self.drive(registered, &execution).await;

        if let Err(err) = self.shared.locks.release(&execution.id).await {
            warn!(execution_id = %execution.id, "lock release failed: {err}");
        }
        self.shared.cache.invalidate_execution(&execution.id);

        result
    }

    async fn drive(
        &self,
        registered: Arc<RegisteredWorkflow>,
        execution: &WorkflowExecution,
    ) -> Result<Value, WorkflowError> {
        let shared = &self.shared;
        let retry = registered
            .options
            .retry
            .clone()
            .unwrap_or_else(RetryPolicy::no_retry);
        let mut attempt = next_attempt(execution.metadata.as_ref());

        loop {
            let metadata = metadata_with_attempt(execution.metadata.clone(), attempt);
            shared
                .store
                .update_execution(
                    &execution.id,
                    ExecutionPatch {
                        status: Some(ExecutionStatus::Running),
                        started_at: Some(shared.clock.now()),
                        metadata: Some(metadata.clone()),
                        ..Default::default()
                    },
                )
                .await?;

            let ctx = WorkflowContext {
                shared: shared.clone(),
                execution_id: execution.id.clone(),
                workflow_name: execution.workflow_name.clone(),
                input: execution.input.clone().unwrap_or(Value::Null),
                attempt,
                metadata: Some(metadata),
            };

            match invoke_handler(shared, &registered, ctx).await {
                Ok(output) => {
                    shared
                        .store
                        .update_execution(
                            &execution.id,
                            ExecutionPatch {
                                status: Some(ExecutionStatus::Completed),
                                output: Some(output.clone()),
                                completed_at: Some(shared.clock.now()),
                                ..Default::default()
                            },
                        )
                        .await?;
                    info!(execution_id = %execution.id, "workflow completed");
                    return Ok(output);
                }
                Err(err) if err.kind() == ErrorKind::Cancelled => {
                    // cancel() owns the status; only stamp the finish time
                    shared
                        .store
                        .update_execution(
                            &execution.id,
                            ExecutionPatch {
                                completed_at: Some(shared.clock.now()),
                                ..Default::default()
                            },
                        )
                        .await?;
                    return Err(err);
                }
                Err(err) => {
                    if retry.has_attempts_remaining(attempt) {
                        warn!(
                            execution_id = %execution.id,
                            attempt,
                            "workflow attempt failed, retrying: {err}"
                        );
                        shared.delay.sleep(retry.backoff_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    shared
                        .store
                        .update_execution(
                            &execution.id,
                            ExecutionPatch {
                                status: Some(ExecutionStatus::Failed),
                                error: Some(err.to_value()),
                                completed_at: Some(shared.clock.now()),
                                ..Default::default()
                            },
                        )
                        .await?;
                    error!(execution_id = %execution.id, "workflow failed: {err}");
                    return Err(err);
                }
            }
        }
    }
}

async fn invoke_handler(
    shared: &SharedHandle,
    registered: &RegisteredWorkflow,
    ctx: WorkflowContext,
) -> Result<Value, WorkflowError> {
    let fut = (registered.handler)(ctx);
    match registered.options.timeout {
        None => fut.await,
        Some(limit) => {
            tokio::select! {
                result = fut => result,
                _ = shared.delay.sleep(limit) => Err(WorkflowError::Timeout {
                    timeout_ms: limit.as_millis() as u64,
                }),
            }
        }
    }
}

/// Get-or-create the definition row, bumping version on re-registration
///
/// Runs inside a store transaction; a concurrent creator's conflict is
/// resolved by re-reading the winner's row.
async fn ensure_definition(
    shared: &EngineShared,
    name: &str,
    options: &WorkflowOptions,
) -> Result<WorkflowDefinition, StoreError> {
    let result: Arc<Mutex<Option<WorkflowDefinition>>> = Arc::new(Mutex::new(None));

    let out = result.clone();
    let tx_name = name.to_string();
    let tx_options = options.clone();
    let now = shared.clock.now();

    shared
        .store
        .transaction(boxed_tx(move |store: &dyn WorkflowStore| {
            Box::pin(async move {
                let definition = match store.definition_by_name(&tx_name).await? {
                    Some(existing) => {
                        let changed = existing.version != tx_options.version
                            || existing.description != tx_options.description
                            || !existing.is_active;
                        if changed {
                            store
                                .update_definition(
                                    existing.id,
                                    DefinitionPatch {
                                        version: Some(tx_options.version.clone()),
                                        description: tx_options.description.clone(),
                                        schema: tx_options.schema.clone(),
                                        is_active: Some(true),
                                    },
                                )
                                .await?
                        } else {
                            existing
                        }
                    }
                    None => {
                        let candidate = WorkflowDefinition {
                            id: Uuid::now_v7(),
                            name: tx_name.clone(),
                            version: tx_options.version.clone(),
                            description: tx_options.description.clone(),
                            schema: tx_options.schema.clone(),
                            is_active: true,
                            created_at: now,
                            updated_at: now,
                        };
                        match store.create_definition(candidate).await {
                            Ok(created) => created,
                            Err(StoreError::Conflict(_)) => store
                                .definition_by_name(&tx_name)
                                .await?
                                .ok_or_else(|| StoreError::DefinitionNotFound(tx_name.clone()))?,
                            Err(err) => return Err(err),
                        }
                    }
                };

                *out.lock() = Some(definition);
                Ok(())
            })
        }))
        .await?;

    let definition = result.lock().take();
    definition.ok_or_else(|| StoreError::DefinitionNotFound(name.to_string()))
}

/// Workflow-level attempt derived from execution metadata
fn next_attempt(metadata: Option<&Value>) -> u32 {
    let previous = metadata
        .and_then(|m| m.get("attempt"))
        .and_then(Value::as_u64)
        .unwrap_or(0);
    previous as u32 + 1
}

/// Merge the attempt counter into the metadata object, preserving other keys
fn metadata_with_attempt(metadata: Option<Value>, attempt: u32) -> Value {
    let mut map = match metadata {
        Some(Value::Object(map)) => map,
        _ => Map::new(),
    };
    map.insert("attempt".to_string(), Value::from(attempt));
    Value::Object(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_next_attempt_defaults_to_one() {
        assert_eq!(next_attempt(None), 1);
        assert_eq!(next_attempt(Some(&json!({"other": true}))), 1);
    }

    #[test]
    fn test_next_attempt_increments() {
        assert_eq!(next_attempt(Some(&json!({"attempt": 2}))), 3);
    }

    #[test]
    fn test_metadata_with_attempt_preserves_keys() {
        let merged = metadata_with_attempt(Some(json!({"tenant": "acme"})), 4);
        assert_eq!(merged, json!({"tenant": "acme", "attempt": 4}));
    }

    #[test]
    fn test_metadata_with_attempt_replaces_non_objects() {
        let merged = metadata_with_attempt(Some(json!("scalar")), 1);
        assert_eq!(merged, json!({"attempt": 1}));
    }
}
