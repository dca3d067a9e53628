//! In-memory implementation of WorkflowStore
//!
//! Primarily for tests and embedders without a database. Tables are plain
//! vectors in insertion order, which doubles as creation order for the
//! program-order step queries even under a frozen test clock.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::reliability::CircuitState;

use super::metrics::{QueryMetrics, StoreStats};
use super::records::*;
use super::store::{StoreError, TxFn, WorkflowStore};

#[derive(Default, Clone)]
struct MemoryState {
    definitions: Vec<WorkflowDefinition>,
    executions: Vec<WorkflowExecution>,
    steps: Vec<StepExecution>,
    circuits: Vec<CircuitBreakerRecord>,
    locks: Vec<WorkflowLock>,
}

/// In-memory implementation of WorkflowStore
///
/// Provides the same semantics as the PostgreSQL implementation.
/// Transactions are realized as snapshot/restore under a store-wide
/// transaction lock; nested transactions are not supported.
///
/// # Example
///
/// ```
/// use restep::MemoryStore;
///
/// let store = MemoryStore::new();
/// ```
pub struct MemoryStore {
    state: RwLock<MemoryState>,
    clock: Arc<dyn Clock>,
    metrics: QueryMetrics,
    tx_lock: tokio::sync::Mutex<()>,
}

impl MemoryStore {
    /// Create a store using the system clock
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a store with an injected clock (tests)
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: RwLock::new(MemoryState::default()),
            clock,
            metrics: QueryMetrics::new(),
            tx_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Always healthy; mirrors the operator surface of the SQL store
    pub fn health_check(&self) -> bool {
        true
    }

    /// Row counts per table
    pub fn stats(&self) -> StoreStats {
        let state = self.state.read();
        StoreStats {
            definitions: state.definitions.len() as u64,
            executions: state.executions.len() as u64,
            steps: state.steps.len() as u64,
            circuit_breakers: state.circuits.len() as u64,
            locks: state.locks.len() as u64,
        }
    }

    /// Operation counters; durations are not tracked in memory
    pub fn performance_metrics(&self) -> super::metrics::PerformanceMetrics {
        self.metrics.snapshot()
    }

    /// Drop all rows (tests)
    pub fn clear(&self) {
        *self.state.write() = MemoryState::default();
    }

    fn track(&self, operation: &'static str) {
        self.metrics.record(operation, std::time::Duration::ZERO);
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkflowStore for MemoryStore {
    async fn create_definition(
        &self,
        mut definition: WorkflowDefinition,
    ) -> Result<WorkflowDefinition, StoreError> {
        self.track("create_definition");
        let mut state = self.state.write();

        if state.definitions.iter().any(|d| d.name == definition.name) {
            return Err(StoreError::Conflict(format!(
                "definition name already exists: {}",
                definition.name
            )));
        }

        definition.schema = normalize_json(definition.schema);
        state.definitions.push(definition.clone());
        Ok(definition)
    }

    async fn definition_by_id(&self, id: Uuid) -> Result<Option<WorkflowDefinition>, StoreError> {
        self.track("definition_by_id");
        let state = self.state.read();
        Ok(state.definitions.iter().find(|d| d.id == id).cloned())
    }

    async fn definition_by_name(
        &self,
        name: &str,
    ) -> Result<Option<WorkflowDefinition>, StoreError> {
        self.track("definition_by_name");
        let state = self.state.read();
        Ok(state.definitions.iter().find(|d| d.name == name).cloned())
    }

    async fn update_definition(
        &self,
        id: Uuid,
        patch: DefinitionPatch,
    ) -> Result<WorkflowDefinition, StoreError> {
        self.track("update_definition");
        let now = self.clock.now();
        let mut state = self.state.write();

        let definition = state
            .definitions
            .iter_mut()
            .find(|d| d.id == id)
            .ok_or_else(|| StoreError::DefinitionNotFound(id.to_string()))?;

        if let Some(version) = patch.version {
            definition.version = version;
        }
        if let Some(description) = patch.description {
            definition.description = Some(description);
        }
        if let Some(schema) = patch.schema {
            definition.schema = normalize_json(Some(schema));
        }
        if let Some(is_active) = patch.is_active {
            definition.is_active = is_active;
        }
        definition.updated_at = now;

        Ok(definition.clone())
    }

    async fn list_active_definitions(&self) -> Result<Vec<WorkflowDefinition>, StoreError> {
        self.track("list_active_definitions");
        let state = self.state.read();
        let mut active: Vec<_> = state
            .definitions
            .iter()
            .filter(|d| d.is_active)
            .cloned()
            .collect();
        active.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(active)
    }

    async fn create_execution(
        &self,
        execution: NewExecution,
    ) -> Result<WorkflowExecution, StoreError> {
        self.track("create_execution");
        let now = self.clock.now();
        let mut state = self.state.write();

        if state.executions.iter().any(|e| e.id == execution.id) {
            return Err(StoreError::Conflict(format!(
                "execution id already exists: {}",
                execution.id
            )));
        }

        let record = WorkflowExecution {
            id: execution.id,
            definition_id: execution.definition_id,
            workflow_name: execution.workflow_name,
            status: execution.status,
            input: normalize_json(execution.input),
            output: None,
            error: None,
            metadata: normalize_json(execution.metadata),
            started_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        };
        state.executions.push(record.clone());
        Ok(record)
    }

    async fn execution_by_id(&self, id: &str) -> Result<Option<WorkflowExecution>, StoreError> {
        self.track("execution_by_id");
        let state = self.state.read();
        Ok(state.executions.iter().find(|e| e.id == id).cloned())
    }

    async fn update_execution(
        &self,
        id: &str,
        patch: ExecutionPatch,
    ) -> Result<WorkflowExecution, StoreError> {
        self.track("update_execution");
        let now = self.clock.now();
        let mut state = self.state.write();

        let execution = state
            .executions
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| StoreError::ExecutionNotFound(id.to_string()))?;

        if let Some(status) = patch.status {
            execution.status = status;
        }
        if let Some(input) = patch.input {
            execution.input = normalize_json(Some(input));
        }
        if let Some(output) = patch.output {
            execution.output = normalize_json(Some(output));
        }
        if let Some(error) = patch.error {
            execution.error = normalize_json(Some(error));
        }
        if let Some(metadata) = patch.metadata {
            execution.metadata = normalize_json(Some(metadata));
        }
        if let Some(started_at) = patch.started_at {
            execution.started_at = Some(started_at);
        }
        if let Some(completed_at) = patch.completed_at {
            execution.completed_at = Some(completed_at);
        }
        execution.updated_at = now;

        Ok(execution.clone())
    }

    async fn executions_by_name_and_status(
        &self,
        workflow_name: &str,
        status: ExecutionStatus,
    ) -> Result<Vec<WorkflowExecution>, StoreError> {
        self.track("executions_by_name_and_status");
        let state = self.state.read();
        let mut matching: Vec<_> = state
            .executions
            .iter()
            .filter(|e| e.workflow_name == workflow_name && e.status == status)
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(matching)
    }

    async fn resumable_executions(&self) -> Result<Vec<WorkflowExecution>, StoreError> {
        self.track("resumable_executions");
        let state = self.state.read();
        let mut running: Vec<_> = state
            .executions
            .iter()
            .filter(|e| e.status == ExecutionStatus::Running)
            .cloned()
            .collect();
        running.sort_by_key(|e| e.started_at.unwrap_or(e.created_at));
        Ok(running)
    }

    async fn create_step(&self, step: NewStep) -> Result<StepExecution, StoreError> {
        self.track("create_step");
        let now = self.clock.now();
        let mut state = self.state.write();

        let record = StepExecution {
            id: step.id,
            execution_id: step.execution_id,
            step_name: step.step_name,
            status: step.status,
            input: normalize_json(step.input),
            output: None,
            error: None,
            attempt: step.attempt.max(1),
            max_attempts: step.max_attempts.max(1),
            started_at: step.started_at,
            completed_at: None,
            created_at: now,
            updated_at: now,
        };
        state.steps.push(record.clone());
        Ok(record)
    }

    async fn update_step(&self, id: Uuid, patch: StepPatch) -> Result<StepExecution, StoreError> {
        self.track("update_step");
        let now = self.clock.now();
        let mut state = self.state.write();

        let step = state
            .steps
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or(StoreError::StepNotFound(id))?;

        if let Some(status) = patch.status {
            step.status = status;
        }
        if let Some(input) = patch.input {
            step.input = normalize_json(Some(input));
        }
        if let Some(output) = patch.output {
            step.output = normalize_json(Some(output));
        }
        if let Some(error) = patch.error {
            step.error = normalize_json(Some(error));
        }
        if let Some(attempt) = patch.attempt {
            step.attempt = attempt.clamp(1, step.max_attempts);
        }
        if let Some(started_at) = patch.started_at {
            step.started_at = Some(started_at);
        }
        if let Some(completed_at) = patch.completed_at {
            step.completed_at = Some(completed_at);
        }
        step.updated_at = now;

        Ok(step.clone())
    }

    async fn steps_by_execution(
        &self,
        execution_id: &str,
    ) -> Result<Vec<StepExecution>, StoreError> {
        self.track("steps_by_execution");
        let state = self.state.read();
        // Vec preserves insertion order == created_at ascending
        Ok(state
            .steps
            .iter()
            .filter(|s| s.execution_id == execution_id)
            .cloned()
            .collect())
    }

    async fn step_by_execution_and_name(
        &self,
        execution_id: &str,
        step_name: &str,
    ) -> Result<Option<StepExecution>, StoreError> {
        self.track("step_by_execution_and_name");
        let state = self.state.read();
        Ok(state
            .steps
            .iter()
            .filter(|s| s.execution_id == execution_id && s.step_name == step_name)
            .last()
            .cloned())
    }

    async fn retryable_steps(
        &self,
        execution_id: &str,
    ) -> Result<Vec<StepExecution>, StoreError> {
        self.track("retryable_steps");
        let state = self.state.read();
        Ok(state
            .steps
            .iter()
            .filter(|s| s.execution_id == execution_id && s.is_retryable())
            .cloned()
            .collect())
    }

    async fn circuit_get_or_create(
        &self,
        name: &str,
    ) -> Result<CircuitBreakerRecord, StoreError> {
        self.track("circuit_get_or_create");
        let now = self.clock.now();
        let mut state = self.state.write();

        if let Some(circuit) = state.circuits.iter().find(|c| c.name == name) {
            return Ok(circuit.clone());
        }

        let record = CircuitBreakerRecord {
            id: Uuid::now_v7(),
            name: name.to_string(),
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure_at: None,
            next_attempt_at: None,
            created_at: now,
            updated_at: now,
        };
        state.circuits.push(record.clone());
        Ok(record)
    }

    async fn update_circuit(
        &self,
        name: &str,
        patch: CircuitPatch,
    ) -> Result<CircuitBreakerRecord, StoreError> {
        self.track("update_circuit");
        let now = self.clock.now();
        let mut state = self.state.write();

        let index = match state.circuits.iter().position(|c| c.name == name) {
            Some(index) => index,
            None => {
                state.circuits.push(CircuitBreakerRecord {
                    id: Uuid::now_v7(),
                    name: name.to_string(),
                    state: CircuitState::Closed,
                    failure_count: 0,
                    last_failure_at: None,
                    next_attempt_at: None,
                    created_at: now,
                    updated_at: now,
                });
                state.circuits.len() - 1
            }
        };
        let circuit = &mut state.circuits[index];

        circuit.state = patch.state;
        circuit.failure_count = patch.failure_count;
        circuit.last_failure_at = patch.last_failure_at;
        circuit.next_attempt_at = patch.next_attempt_at;
        circuit.updated_at = now;

        Ok(circuit.clone())
    }

    async fn reset_circuit(&self, name: &str) -> Result<CircuitBreakerRecord, StoreError> {
        self.track("reset_circuit");
        self.update_circuit(
            name,
            CircuitPatch {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure_at: None,
                next_attempt_at: None,
            },
        )
        .await
    }

    async fn acquire_lock(
        &self,
        execution_id: &str,
        lock_key: &str,
        acquired_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.track("acquire_lock");
        let mut state = self.state.write();

        // Unique constraint on execution_id; expired rows still block until cleanup
        if state.locks.iter().any(|l| l.execution_id == execution_id) {
            return Ok(false);
        }

        state.locks.push(WorkflowLock {
            id: Uuid::now_v7(),
            execution_id: execution_id.to_string(),
            lock_key: lock_key.to_string(),
            acquired_at,
            expires_at,
            metadata: None,
        });
        Ok(true)
    }

    async fn release_lock(&self, execution_id: &str) -> Result<bool, StoreError> {
        self.track("release_lock");
        let mut state = self.state.write();
        let before = state.locks.len();
        state.locks.retain(|l| l.execution_id != execution_id);
        Ok(state.locks.len() < before)
    }

    async fn cleanup_expired_locks(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        self.track("cleanup_expired_locks");
        let mut state = self.state.write();
        let before = state.locks.len();
        state.locks.retain(|l| !l.is_expired(now));
        Ok((before - state.locks.len()) as u64)
    }

    async fn transaction(&self, f: TxFn) -> Result<(), StoreError> {
        self.track("transaction");
        let _guard = self.tx_lock.lock().await;
        let snapshot = self.state.read().clone();

        match f(self).await {
            Ok(()) => Ok(()),
            Err(err) => {
                *self.state.write() = snapshot;
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::persistence::boxed_tx;
    use serde_json::{json, Value};

    fn definition(name: &str) -> WorkflowDefinition {
        let now = Utc::now();
        WorkflowDefinition {
            id: Uuid::now_v7(),
            name: name.to_string(),
            version: "1.0.0".to_string(),
            description: None,
            schema: None,
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }

    fn new_execution(store_def: &WorkflowDefinition, id: &str) -> NewExecution {
        NewExecution {
            id: id.to_string(),
            definition_id: store_def.id,
            workflow_name: store_def.name.clone(),
            status: ExecutionStatus::Pending,
            input: Some(json!({"n": 1})),
            metadata: None,
        }
    }

    fn new_step(execution_id: &str, name: &str) -> NewStep {
        NewStep {
            id: Uuid::now_v7(),
            execution_id: execution_id.to_string(),
            step_name: name.to_string(),
            status: StepStatus::Running,
            input: None,
            attempt: 1,
            max_attempts: 3,
            started_at: Some(Utc::now()),
        }
    }

    #[tokio::test]
    async fn test_definition_name_is_unique() {
        let store = MemoryStore::new();
        store.create_definition(definition("w1")).await.unwrap();

        let result = store.create_definition(definition("w1")).await;
        assert!(matches!(result, Err(StoreError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_list_active_ordered_by_name() {
        let store = MemoryStore::new();
        let b = store.create_definition(definition("b")).await.unwrap();
        store.create_definition(definition("a")).await.unwrap();
        store.create_definition(definition("c")).await.unwrap();

        store
            .update_definition(
                b.id,
                DefinitionPatch {
                    is_active: Some(false),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let active = store.list_active_definitions().await.unwrap();
        let names: Vec<_> = active.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["a", "c"]);
    }

    #[tokio::test]
    async fn test_definition_lookup_by_id_and_name() {
        let store = MemoryStore::new();
        let created = store.create_definition(definition("w1")).await.unwrap();

        let by_id = store.definition_by_id(created.id).await.unwrap().unwrap();
        assert_eq!(by_id.name, "w1");
        assert!(store
            .definition_by_id(Uuid::now_v7())
            .await
            .unwrap()
            .is_none());
        assert!(store.definition_by_name("w1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_executions_by_name_and_status_newest_first() {
        let clock = Arc::new(ManualClock::starting_now());
        let store = MemoryStore::with_clock(clock.clone());
        let def = store.create_definition(definition("w1")).await.unwrap();

        store.create_execution(new_execution(&def, "old")).await.unwrap();
        clock.advance(std::time::Duration::from_secs(1));
        store.create_execution(new_execution(&def, "new")).await.unwrap();

        let pending = store
            .executions_by_name_and_status("w1", ExecutionStatus::Pending)
            .await
            .unwrap();
        let ids: Vec<_> = pending.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["new", "old"]);

        let running = store
            .executions_by_name_and_status("w1", ExecutionStatus::Running)
            .await
            .unwrap();
        assert!(running.is_empty());
    }

    #[tokio::test]
    async fn test_execution_id_is_unique() {
        let store = MemoryStore::new();
        let def = store.create_definition(definition("w1")).await.unwrap();

        store.create_execution(new_execution(&def, "e1")).await.unwrap();
        let result = store.create_execution(new_execution(&def, "e1")).await;
        assert!(matches!(result, Err(StoreError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_null_input_reads_as_absent() {
        let store = MemoryStore::new();
        let def = store.create_definition(definition("w1")).await.unwrap();

        let mut execution = new_execution(&def, "e1");
        execution.input = Some(Value::Null);
        let created = store.create_execution(execution).await.unwrap();
        assert_eq!(created.input, None);
    }

    #[tokio::test]
    async fn test_steps_in_program_order() {
        let clock = Arc::new(ManualClock::starting_now());
        let store = MemoryStore::with_clock(clock);
        let def = store.create_definition(definition("w1")).await.unwrap();
        store.create_execution(new_execution(&def, "e1")).await.unwrap();

        // Frozen clock: identical created_at, insertion order must still hold
        for name in ["a", "b", "c"] {
            store.create_step(new_step("e1", name)).await.unwrap();
        }

        let steps = store.steps_by_execution("e1").await.unwrap();
        let names: Vec<_> = steps.iter().map(|s| s.step_name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_most_recent_step_row_wins() {
        let store = MemoryStore::new();
        let def = store.create_definition(definition("w1")).await.unwrap();
        store.create_execution(new_execution(&def, "e1")).await.unwrap();

        let first = store.create_step(new_step("e1", "x")).await.unwrap();
        let second = store.create_step(new_step("e1", "x")).await.unwrap();
        assert_ne!(first.id, second.id);

        let found = store
            .step_by_execution_and_name("e1", "x")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, second.id);
    }

    #[tokio::test]
    async fn test_retryable_steps() {
        let store = MemoryStore::new();
        let def = store.create_definition(definition("w1")).await.unwrap();
        store.create_execution(new_execution(&def, "e1")).await.unwrap();

        let failed = store.create_step(new_step("e1", "a")).await.unwrap();
        store
            .update_step(
                failed.id,
                StepPatch {
                    status: Some(StepStatus::Failed),
                    attempt: Some(1),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let exhausted = store.create_step(new_step("e1", "b")).await.unwrap();
        store
            .update_step(
                exhausted.id,
                StepPatch {
                    status: Some(StepStatus::Failed),
                    attempt: Some(3),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let retryable = store.retryable_steps("e1").await.unwrap();
        assert_eq!(retryable.len(), 1);
        assert_eq!(retryable[0].step_name, "a");
    }

    #[tokio::test]
    async fn test_lock_uniqueness_and_release() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let expires = now + chrono::Duration::minutes(5);

        assert!(store.acquire_lock("e1", "k", now, expires).await.unwrap());
        assert!(!store.acquire_lock("e1", "k", now, expires).await.unwrap());

        assert!(store.release_lock("e1").await.unwrap());
        assert!(!store.release_lock("e1").await.unwrap());

        assert!(store.acquire_lock("e1", "k", now, expires).await.unwrap());
    }

    #[tokio::test]
    async fn test_cleanup_expired_is_inclusive() {
        let store = MemoryStore::new();
        let now = Utc::now();

        // expires exactly at `now` must be reclaimed
        store.acquire_lock("e1", "k", now, now).await.unwrap();
        store
            .acquire_lock("e2", "k", now, now + chrono::Duration::minutes(5))
            .await
            .unwrap();

        let removed = store.cleanup_expired_locks(now).await.unwrap();
        assert_eq!(removed, 1);
        assert!(store.acquire_lock("e1", "k", now, now).await.unwrap());
        assert!(!store.acquire_lock("e2", "k", now, now).await.unwrap());
    }

    #[tokio::test]
    async fn test_transaction_rolls_back_on_error() {
        let store = MemoryStore::new();

        let result = store
            .transaction(boxed_tx(|s: &dyn WorkflowStore| {
                Box::pin(async move {
                    s.create_definition(WorkflowDefinition {
                        id: Uuid::now_v7(),
                        name: "doomed".to_string(),
                        version: "1.0.0".to_string(),
                        description: None,
                        schema: None,
                        is_active: true,
                        created_at: Utc::now(),
                        updated_at: Utc::now(),
                    })
                    .await?;
                    Err(StoreError::Conflict("abort".into()))
                })
            }))
            .await;

        assert!(result.is_err());
        assert_eq!(store.definition_by_name("doomed").await.unwrap(), None);
        assert_eq!(store.stats().definitions, 0);
    }

    #[tokio::test]
    async fn test_transaction_commits_on_ok() {
        let store = MemoryStore::new();

        store
            .transaction(boxed_tx(|s: &dyn WorkflowStore| {
                Box::pin(async move {
                    s.create_definition(WorkflowDefinition {
                        id: Uuid::now_v7(),
                        name: "kept".to_string(),
                        version: "1.0.0".to_string(),
                        description: None,
                        schema: None,
                        is_active: true,
                        created_at: Utc::now(),
                        updated_at: Utc::now(),
                    })
                    .await?;
                    Ok(())
                })
            }))
            .await
            .unwrap();

        assert!(store.definition_by_name("kept").await.unwrap().is_some());
    }
}
