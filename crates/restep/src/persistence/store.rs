//! WorkflowStore trait definition

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use uuid::Uuid;

use super::records::{
    CircuitBreakerRecord, CircuitPatch, DefinitionPatch, ExecutionPatch, ExecutionStatus,
    NewExecution, NewStep, StepExecution, StepPatch, WorkflowDefinition, WorkflowExecution,
};

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Definition not found
    #[error("definition not found: {0}")]
    DefinitionNotFound(String),

    /// Execution not found
    #[error("execution not found: {0}")]
    ExecutionNotFound(String),

    /// Step not found
    #[error("step not found: {0}")]
    StepNotFound(Uuid),

    /// Unique constraint violation
    #[error("conflict: {0}")]
    Conflict(String),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Closure run inside [`WorkflowStore::transaction`]
///
/// Receives a store view whose writes are atomic: an `Err` return rolls
/// back everything issued through it.
pub type TxFn = Box<
    dyn for<'a> FnOnce(&'a dyn WorkflowStore) -> BoxFuture<'a, Result<(), StoreError>>
        + Send,
>;

/// Helper to build a [`TxFn`] without spelling out the boxed type
pub fn boxed_tx<F>(f: F) -> TxFn
where
    F: for<'a> FnOnce(&'a dyn WorkflowStore) -> BoxFuture<'a, Result<(), StoreError>>
        + Send
        + 'static,
{
    Box::new(f)
}

/// Durable persistence for definitions, executions, steps, breakers, locks
///
/// Any storage engine with transactional updates and unique-key constraints
/// satisfies this trait. Implementations must be thread-safe; the store is
/// the source of truth across processes.
#[async_trait]
pub trait WorkflowStore: Send + Sync + 'static {
    // =========================================================================
    // Workflow Definitions
    // =========================================================================

    /// Insert a definition; fails with `Conflict` when the name exists
    async fn create_definition(
        &self,
        definition: WorkflowDefinition,
    ) -> Result<WorkflowDefinition, StoreError>;

    async fn definition_by_id(&self, id: Uuid) -> Result<Option<WorkflowDefinition>, StoreError>;

    async fn definition_by_name(
        &self,
        name: &str,
    ) -> Result<Option<WorkflowDefinition>, StoreError>;

    /// Apply a partial update; fails with `DefinitionNotFound` when absent
    async fn update_definition(
        &self,
        id: Uuid,
        patch: DefinitionPatch,
    ) -> Result<WorkflowDefinition, StoreError>;

    /// Active definitions ordered by name ascending
    async fn list_active_definitions(&self) -> Result<Vec<WorkflowDefinition>, StoreError>;

    // =========================================================================
    // Workflow Executions
    // =========================================================================

    /// Insert an execution with a caller-supplied id; `Conflict` when taken
    async fn create_execution(
        &self,
        execution: NewExecution,
    ) -> Result<WorkflowExecution, StoreError>;

    async fn execution_by_id(&self, id: &str) -> Result<Option<WorkflowExecution>, StoreError>;

    async fn update_execution(
        &self,
        id: &str,
        patch: ExecutionPatch,
    ) -> Result<WorkflowExecution, StoreError>;

    /// Executions for a workflow in a status, ordered by created_at descending
    async fn executions_by_name_and_status(
        &self,
        workflow_name: &str,
        status: ExecutionStatus,
    ) -> Result<Vec<WorkflowExecution>, StoreError>;

    /// Running executions ordered by started_at ascending (oldest first)
    async fn resumable_executions(&self) -> Result<Vec<WorkflowExecution>, StoreError>;

    // =========================================================================
    // Step Executions
    // =========================================================================

    async fn create_step(&self, step: NewStep) -> Result<StepExecution, StoreError>;

    async fn update_step(&self, id: Uuid, patch: StepPatch) -> Result<StepExecution, StoreError>;

    /// Steps of an execution in program order (created_at ascending)
    async fn steps_by_execution(
        &self,
        execution_id: &str,
    ) -> Result<Vec<StepExecution>, StoreError>;

    /// Most recent step row for `(execution_id, step_name)`
    async fn step_by_execution_and_name(
        &self,
        execution_id: &str,
        step_name: &str,
    ) -> Result<Option<StepExecution>, StoreError>;

    /// Failed steps with attempts remaining
    async fn retryable_steps(
        &self,
        execution_id: &str,
    ) -> Result<Vec<StepExecution>, StoreError>;

    // =========================================================================
    // Circuit Breakers
    // =========================================================================

    /// Fetch the named breaker, creating a closed one on first use
    async fn circuit_get_or_create(
        &self,
        name: &str,
    ) -> Result<CircuitBreakerRecord, StoreError>;

    /// Write a breaker transition (full replacement of mutable fields)
    async fn update_circuit(
        &self,
        name: &str,
        patch: CircuitPatch,
    ) -> Result<CircuitBreakerRecord, StoreError>;

    /// Clear counters and timestamps, set state to closed
    async fn reset_circuit(&self, name: &str) -> Result<CircuitBreakerRecord, StoreError>;

    // =========================================================================
    // Locks
    // =========================================================================

    /// Insert a lock row; `Ok(false)` when a row already exists for the
    /// execution (constraint violation is contention, not an error)
    async fn acquire_lock(
        &self,
        execution_id: &str,
        lock_key: &str,
        acquired_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Delete the lock row; `Ok(false)` when no row existed
    async fn release_lock(&self, execution_id: &str) -> Result<bool, StoreError>;

    /// Delete rows with `expires_at <= now`, returning the count
    async fn cleanup_expired_locks(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;

    // =========================================================================
    // Transactions
    // =========================================================================

    /// Run `f` atomically: an `Err` return rolls back every write issued
    /// through the store handle passed to the closure
    async fn transaction(&self, f: TxFn) -> Result<(), StoreError>;
}
