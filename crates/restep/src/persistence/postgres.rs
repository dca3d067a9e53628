//! PostgreSQL implementation of WorkflowStore
//!
//! Production persistence with:
//! - Unique constraints backing lock acquisition and definition names
//! - JSONB columns for opaque input/output/error/metadata blobs
//! - `transaction(fn)` mapped onto a real database transaction
//!
//! Schema lives in `migrations/`; apply with `sqlx migrate run` or any
//! migration runner pointed at the same files.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use super::metrics::{PerformanceMetrics, QueryMetrics, StoreStats};
use super::records::*;
use super::store::{StoreError, TxFn, WorkflowStore};

/// PostgreSQL implementation of WorkflowStore
///
/// # Example
///
/// ```ignore
/// use restep::PostgresStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/workflows").await?;
/// let store = PostgresStore::new(pool);
/// ```
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
    metrics: std::sync::Arc<QueryMetrics>,
}

impl PostgresStore {
    /// Create a new store with the given connection pool
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            metrics: std::sync::Arc::new(QueryMetrics::new()),
        }
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Ping the database
    pub async fn health_check(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }

    /// Row counts per table
    pub async fn stats(&self) -> Result<StoreStats, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                (SELECT COUNT(*) FROM workflow_definitions) AS definitions,
                (SELECT COUNT(*) FROM workflow_executions) AS executions,
                (SELECT COUNT(*) FROM step_executions) AS steps,
                (SELECT COUNT(*) FROM circuit_breaker_states) AS circuit_breakers,
                (SELECT COUNT(*) FROM workflow_locks) AS locks
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(StoreStats {
            definitions: row.get::<i64, _>("definitions") as u64,
            executions: row.get::<i64, _>("executions") as u64,
            steps: row.get::<i64, _>("steps") as u64,
            circuit_breakers: row.get::<i64, _>("circuit_breakers") as u64,
            locks: row.get::<i64, _>("locks") as u64,
        })
    }

    /// Operation timings, including the slow-query ring
    pub fn performance_metrics(&self) -> PerformanceMetrics {
        self.metrics.snapshot()
    }

    async fn timed<T, F>(&self, operation: &'static str, fut: F) -> Result<T, StoreError>
    where
        F: std::future::Future<Output = Result<T, StoreError>>,
    {
        let started = std::time::Instant::now();
        let result = fut.await;
        self.metrics.record(operation, started.elapsed());
        result
    }
}

fn db_err(e: sqlx::Error) -> StoreError {
    error!("database error: {e}");
    StoreError::Database(e.to_string())
}

fn insert_err(e: sqlx::Error, conflict: &str) -> StoreError {
    match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            StoreError::Conflict(conflict.to_string())
        }
        _ => db_err(e),
    }
}

fn parse_err(e: String) -> StoreError {
    StoreError::Serialization(e)
}

fn map_definition(row: &PgRow) -> Result<WorkflowDefinition, StoreError> {
    Ok(WorkflowDefinition {
        id: row.get("id"),
        name: row.get("name"),
        version: row.get("version"),
        description: row.get("description"),
        schema: normalize_json(row.get("schema")),
        is_active: row.get("is_active"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn map_execution(row: &PgRow) -> Result<WorkflowExecution, StoreError> {
    let status: String = row.get("status");
    Ok(WorkflowExecution {
        id: row.get("id"),
        definition_id: row.get("definition_id"),
        workflow_name: row.get("workflow_name"),
        status: status.parse().map_err(parse_err)?,
        input: normalize_json(row.get("input")),
        output: normalize_json(row.get("output")),
        error: normalize_json(row.get("error")),
        metadata: normalize_json(row.get("metadata")),
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn map_step(row: &PgRow) -> Result<StepExecution, StoreError> {
    let status: String = row.get("status");
    Ok(StepExecution {
        id: row.get("id"),
        execution_id: row.get("execution_id"),
        step_name: row.get("step_name"),
        status: status.parse().map_err(parse_err)?,
        input: normalize_json(row.get("input")),
        output: normalize_json(row.get("output")),
        error: normalize_json(row.get("error")),
        attempt: row.get::<i32, _>("attempt").max(0) as u32,
        max_attempts: row.get::<i32, _>("max_attempts").max(0) as u32,
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn map_circuit(row: &PgRow) -> Result<CircuitBreakerRecord, StoreError> {
    let state: String = row.get("state");
    Ok(CircuitBreakerRecord {
        id: row.get("id"),
        name: row.get("name"),
        state: state.parse().map_err(parse_err)?,
        failure_count: row.get::<i32, _>("failure_count").max(0) as u32,
        last_failure_at: row.get("last_failure_at"),
        next_attempt_at: row.get("next_attempt_at"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

/// Shared SQL, generic over pool and transaction executors
mod queries {
    use super::*;
    use sqlx::PgExecutor;

    const DEFINITION_COLUMNS: &str =
        "id, name, version, description, schema, is_active, created_at, updated_at";
    const EXECUTION_COLUMNS: &str = "id, definition_id, workflow_name, status, input, output, \
         error, metadata, started_at, completed_at, created_at, updated_at";
    const STEP_COLUMNS: &str = "id, execution_id, step_name, status, input, output, error, \
         attempt, max_attempts, started_at, completed_at, created_at, updated_at";
    const CIRCUIT_COLUMNS: &str =
        "id, name, state, failure_count, last_failure_at, next_attempt_at, created_at, updated_at";

    pub async fn create_definition<'e, E: PgExecutor<'e>>(
        ex: E,
        definition: WorkflowDefinition,
    ) -> Result<WorkflowDefinition, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO workflow_definitions (id, name, version, description, schema, is_active)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING {DEFINITION_COLUMNS}
            "#,
        ))
        .bind(definition.id)
        .bind(&definition.name)
        .bind(&definition.version)
        .bind(&definition.description)
        .bind(&definition.schema)
        .bind(definition.is_active)
        .fetch_one(ex)
        .await
        .map_err(|e| insert_err(e, "definition name already exists"))?;

        map_definition(&row)
    }

    pub async fn definition_by_id<'e, E: PgExecutor<'e>>(
        ex: E,
        id: Uuid,
    ) -> Result<Option<WorkflowDefinition>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {DEFINITION_COLUMNS} FROM workflow_definitions WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(ex)
        .await
        .map_err(db_err)?;

        row.as_ref().map(map_definition).transpose()
    }

    pub async fn definition_by_name<'e, E: PgExecutor<'e>>(
        ex: E,
        name: &str,
    ) -> Result<Option<WorkflowDefinition>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {DEFINITION_COLUMNS} FROM workflow_definitions WHERE name = $1"
        ))
        .bind(name)
        .fetch_optional(ex)
        .await
        .map_err(db_err)?;

        row.as_ref().map(map_definition).transpose()
    }

    pub async fn update_definition<'e, E: PgExecutor<'e>>(
        ex: E,
        id: Uuid,
        patch: DefinitionPatch,
    ) -> Result<WorkflowDefinition, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE workflow_definitions SET
                version = COALESCE($2, version),
                description = COALESCE($3, description),
                schema = COALESCE($4, schema),
                is_active = COALESCE($5, is_active),
                updated_at = now()
            WHERE id = $1
            RETURNING {DEFINITION_COLUMNS}
            "#,
        ))
        .bind(id)
        .bind(patch.version)
        .bind(patch.description)
        .bind(patch.schema)
        .bind(patch.is_active)
        .fetch_optional(ex)
        .await
        .map_err(db_err)?
        .ok_or_else(|| StoreError::DefinitionNotFound(id.to_string()))?;

        map_definition(&row)
    }

    pub async fn list_active_definitions<'e, E: PgExecutor<'e>>(
        ex: E,
    ) -> Result<Vec<WorkflowDefinition>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {DEFINITION_COLUMNS} FROM workflow_definitions \
             WHERE is_active ORDER BY name ASC"
        ))
        .fetch_all(ex)
        .await
        .map_err(db_err)?;

        rows.iter().map(map_definition).collect()
    }

    pub async fn create_execution<'e, E: PgExecutor<'e>>(
        ex: E,
        execution: NewExecution,
    ) -> Result<WorkflowExecution, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO workflow_executions (id, definition_id, workflow_name, status, input, metadata)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING {EXECUTION_COLUMNS}
            "#,
        ))
        .bind(&execution.id)
        .bind(execution.definition_id)
        .bind(&execution.workflow_name)
        .bind(execution.status.as_str())
        .bind(normalize_json(execution.input))
        .bind(normalize_json(execution.metadata))
        .fetch_one(ex)
        .await
        .map_err(|e| insert_err(e, "execution id already exists"))?;

        map_execution(&row)
    }

    pub async fn execution_by_id<'e, E: PgExecutor<'e>>(
        ex: E,
        id: &str,
    ) -> Result<Option<WorkflowExecution>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM workflow_executions WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(ex)
        .await
        .map_err(db_err)?;

        row.as_ref().map(map_execution).transpose()
    }

    pub async fn update_execution<'e, E: PgExecutor<'e>>(
        ex: E,
        id: &str,
        patch: ExecutionPatch,
    ) -> Result<WorkflowExecution, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE workflow_executions SET
                status = COALESCE($2, status),
                input = COALESCE($3, input),
                output = COALESCE($4, output),
                error = COALESCE($5, error),
                metadata = COALESCE($6, metadata),
                started_at = COALESCE($7, started_at),
                completed_at = COALESCE($8, completed_at),
                updated_at = now()
            WHERE id = $1
            RETURNING {EXECUTION_COLUMNS}
            "#,
        ))
        .bind(id)
        .bind(patch.status.map(|s| s.as_str().to_string()))
        .bind(patch.input)
        .bind(patch.output)
        .bind(patch.error)
        .bind(patch.metadata)
        .bind(patch.started_at)
        .bind(patch.completed_at)
        .fetch_optional(ex)
        .await
        .map_err(db_err)?
        .ok_or_else(|| StoreError::ExecutionNotFound(id.to_string()))?;

        map_execution(&row)
    }

    pub async fn executions_by_name_and_status<'e, E: PgExecutor<'e>>(
        ex: E,
        workflow_name: &str,
        status: ExecutionStatus,
    ) -> Result<Vec<WorkflowExecution>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM workflow_executions \
             WHERE workflow_name = $1 AND status = $2 \
             ORDER BY created_at DESC"
        ))
        .bind(workflow_name)
        .bind(status.as_str())
        .fetch_all(ex)
        .await
        .map_err(db_err)?;

        rows.iter().map(map_execution).collect()
    }

    pub async fn resumable_executions<'e, E: PgExecutor<'e>>(
        ex: E,
    ) -> Result<Vec<WorkflowExecution>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM workflow_executions \
             WHERE status = 'running' ORDER BY started_at ASC NULLS LAST"
        ))
        .fetch_all(ex)
        .await
        .map_err(db_err)?;

        rows.iter().map(map_execution).collect()
    }

    pub async fn create_step<'e, E: PgExecutor<'e>>(
        ex: E,
        step: NewStep,
    ) -> Result<StepExecution, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO step_executions
                (id, execution_id, step_name, status, input, attempt, max_attempts, started_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING {STEP_COLUMNS}
            "#,
        ))
        .bind(step.id)
        .bind(&step.execution_id)
        .bind(&step.step_name)
        .bind(step.status.as_str())
        .bind(normalize_json(step.input))
        .bind(step.attempt.max(1) as i32)
        .bind(step.max_attempts.max(1) as i32)
        .bind(step.started_at)
        .fetch_one(ex)
        .await
        .map_err(db_err)?;

        map_step(&row)
    }

    pub async fn update_step<'e, E: PgExecutor<'e>>(
        ex: E,
        id: Uuid,
        patch: StepPatch,
    ) -> Result<StepExecution, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE step_executions SET
                status = COALESCE($2, status),
                input = COALESCE($3, input),
                output = COALESCE($4, output),
                error = COALESCE($5, error),
                attempt = COALESCE($6, attempt),
                started_at = COALESCE($7, started_at),
                completed_at = COALESCE($8, completed_at),
                updated_at = now()
            WHERE id = $1
            RETURNING {STEP_COLUMNS}
            "#,
        ))
        .bind(id)
        .bind(patch.status.map(|s| s.as_str().to_string()))
        .bind(patch.input)
        .bind(patch.output)
        .bind(patch.error)
        .bind(patch.attempt.map(|a| a as i32))
        .bind(patch.started_at)
        .bind(patch.completed_at)
        .fetch_optional(ex)
        .await
        .map_err(db_err)?
        .ok_or(StoreError::StepNotFound(id))?;

        map_step(&row)
    }

    pub async fn steps_by_execution<'e, E: PgExecutor<'e>>(
        ex: E,
        execution_id: &str,
    ) -> Result<Vec<StepExecution>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {STEP_COLUMNS} FROM step_executions \
             WHERE execution_id = $1 ORDER BY created_at ASC, id ASC"
        ))
        .bind(execution_id)
        .fetch_all(ex)
        .await
        .map_err(db_err)?;

        rows.iter().map(map_step).collect()
    }

    pub async fn step_by_execution_and_name<'e, E: PgExecutor<'e>>(
        ex: E,
        execution_id: &str,
        step_name: &str,
    ) -> Result<Option<StepExecution>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {STEP_COLUMNS} FROM step_executions \
             WHERE execution_id = $1 AND step_name = $2 \
             ORDER BY created_at DESC, id DESC LIMIT 1"
        ))
        .bind(execution_id)
        .bind(step_name)
        .fetch_optional(ex)
        .await
        .map_err(db_err)?;

        row.as_ref().map(map_step).transpose()
    }

    pub async fn retryable_steps<'e, E: PgExecutor<'e>>(
        ex: E,
        execution_id: &str,
    ) -> Result<Vec<StepExecution>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {STEP_COLUMNS} FROM step_executions \
             WHERE execution_id = $1 AND status = 'failed' AND attempt < max_attempts \
             ORDER BY created_at ASC, id ASC"
        ))
        .bind(execution_id)
        .fetch_all(ex)
        .await
        .map_err(db_err)?;

        rows.iter().map(map_step).collect()
    }

    pub async fn circuit_get_or_create<'e, E: PgExecutor<'e>>(
        ex: E,
        name: &str,
    ) -> Result<CircuitBreakerRecord, StoreError> {
        // No-op DO UPDATE so RETURNING yields the existing row on conflict
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO circuit_breaker_states (id, name)
            VALUES ($1, $2)
            ON CONFLICT (name) DO UPDATE SET name = EXCLUDED.name
            RETURNING {CIRCUIT_COLUMNS}
            "#,
        ))
        .bind(Uuid::now_v7())
        .bind(name)
        .fetch_one(ex)
        .await
        .map_err(db_err)?;

        map_circuit(&row)
    }

    pub async fn update_circuit<'e, E: PgExecutor<'e>>(
        ex: E,
        name: &str,
        patch: CircuitPatch,
    ) -> Result<CircuitBreakerRecord, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO circuit_breaker_states
                (id, name, state, failure_count, last_failure_at, next_attempt_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (name) DO UPDATE SET
                state = EXCLUDED.state,
                failure_count = EXCLUDED.failure_count,
                last_failure_at = EXCLUDED.last_failure_at,
                next_attempt_at = EXCLUDED.next_attempt_at,
                updated_at = now()
            RETURNING {CIRCUIT_COLUMNS}
            "#,
        ))
        .bind(Uuid::now_v7())
        .bind(name)
        .bind(patch.state.as_str())
        .bind(patch.failure_count as i32)
        .bind(patch.last_failure_at)
        .bind(patch.next_attempt_at)
        .fetch_one(ex)
        .await
        .map_err(db_err)?;

        map_circuit(&row)
    }

    pub async fn acquire_lock<'e, E: PgExecutor<'e>>(
        ex: E,
        execution_id: &str,
        lock_key: &str,
        acquired_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO workflow_locks (id, execution_id, lock_key, acquired_at, expires_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (execution_id) DO NOTHING
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(execution_id)
        .bind(lock_key)
        .bind(acquired_at)
        .bind(expires_at)
        .execute(ex)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn release_lock<'e, E: PgExecutor<'e>>(
        ex: E,
        execution_id: &str,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM workflow_locks WHERE execution_id = $1")
            .bind(execution_id)
            .execute(ex)
            .await
            .map_err(db_err)?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn cleanup_expired_locks<'e, E: PgExecutor<'e>>(
        ex: E,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM workflow_locks WHERE expires_at <= $1")
            .bind(now)
            .execute(ex)
            .await
            .map_err(db_err)?;

        Ok(result.rows_affected())
    }
}

#[async_trait]
impl WorkflowStore for PostgresStore {
    #[instrument(skip(self, definition), fields(name = %definition.name))]
    async fn create_definition(
        &self,
        definition: WorkflowDefinition,
    ) -> Result<WorkflowDefinition, StoreError> {
        self.timed(
            "create_definition",
            queries::create_definition(&self.pool, definition),
        )
        .await
    }

    async fn definition_by_id(&self, id: Uuid) -> Result<Option<WorkflowDefinition>, StoreError> {
        self.timed("definition_by_id", queries::definition_by_id(&self.pool, id))
            .await
    }

    async fn definition_by_name(
        &self,
        name: &str,
    ) -> Result<Option<WorkflowDefinition>, StoreError> {
        self.timed(
            "definition_by_name",
            queries::definition_by_name(&self.pool, name),
        )
        .await
    }

    async fn update_definition(
        &self,
        id: Uuid,
        patch: DefinitionPatch,
    ) -> Result<WorkflowDefinition, StoreError> {
        self.timed(
            "update_definition",
            queries::update_definition(&self.pool, id, patch),
        )
        .await
    }

    async fn list_active_definitions(&self) -> Result<Vec<WorkflowDefinition>, StoreError> {
        self.timed(
            "list_active_definitions",
            queries::list_active_definitions(&self.pool),
        )
        .await
    }

    #[instrument(skip(self, execution), fields(execution_id = %execution.id))]
    async fn create_execution(
        &self,
        execution: NewExecution,
    ) -> Result<WorkflowExecution, StoreError> {
        let created = self
            .timed(
                "create_execution",
                queries::create_execution(&self.pool, execution),
            )
            .await?;
        debug!(execution_id = %created.id, workflow = %created.workflow_name, "created execution");
        Ok(created)
    }

    async fn execution_by_id(&self, id: &str) -> Result<Option<WorkflowExecution>, StoreError> {
        self.timed("execution_by_id", queries::execution_by_id(&self.pool, id))
            .await
    }

    async fn update_execution(
        &self,
        id: &str,
        patch: ExecutionPatch,
    ) -> Result<WorkflowExecution, StoreError> {
        self.timed(
            "update_execution",
            queries::update_execution(&self.pool, id, patch),
        )
        .await
    }

    async fn executions_by_name_and_status(
        &self,
        workflow_name: &str,
        status: ExecutionStatus,
    ) -> Result<Vec<WorkflowExecution>, StoreError> {
        self.timed(
            "executions_by_name_and_status",
            queries::executions_by_name_and_status(&self.pool, workflow_name, status),
        )
        .await
    }

    async fn resumable_executions(&self) -> Result<Vec<WorkflowExecution>, StoreError> {
        self.timed(
            "resumable_executions",
            queries::resumable_executions(&self.pool),
        )
        .await
    }

    async fn create_step(&self, step: NewStep) -> Result<StepExecution, StoreError> {
        self.timed("create_step", queries::create_step(&self.pool, step))
            .await
    }

    async fn update_step(&self, id: Uuid, patch: StepPatch) -> Result<StepExecution, StoreError> {
        self.timed("update_step", queries::update_step(&self.pool, id, patch))
            .await
    }

    async fn steps_by_execution(
        &self,
        execution_id: &str,
    ) -> Result<Vec<StepExecution>, StoreError> {
        self.timed(
            "steps_by_execution",
            queries::steps_by_execution(&self.pool, execution_id),
        )
        .await
    }

    async fn step_by_execution_and_name(
        &self,
        execution_id: &str,
        step_name: &str,
    ) -> Result<Option<StepExecution>, StoreError> {
        self.timed(
            "step_by_execution_and_name",
            queries::step_by_execution_and_name(&self.pool, execution_id, step_name),
        )
        .await
    }

    async fn retryable_steps(
        &self,
        execution_id: &str,
    ) -> Result<Vec<StepExecution>, StoreError> {
        self.timed(
            "retryable_steps",
            queries::retryable_steps(&self.pool, execution_id),
        )
        .await
    }

    async fn circuit_get_or_create(
        &self,
        name: &str,
    ) -> Result<CircuitBreakerRecord, StoreError> {
        self.timed(
            "circuit_get_or_create",
            queries::circuit_get_or_create(&self.pool, name),
        )
        .await
    }

    async fn update_circuit(
        &self,
        name: &str,
        patch: CircuitPatch,
    ) -> Result<CircuitBreakerRecord, StoreError> {
        self.timed(
            "update_circuit",
            queries::update_circuit(&self.pool, name, patch),
        )
        .await
    }

    async fn reset_circuit(&self, name: &str) -> Result<CircuitBreakerRecord, StoreError> {
        self.timed(
            "reset_circuit",
            queries::update_circuit(
                &self.pool,
                name,
                CircuitPatch {
                    state: crate::reliability::CircuitState::Closed,
                    failure_count: 0,
                    last_failure_at: None,
                    next_attempt_at: None,
                },
            ),
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
        self.timed(
            "acquire_lock",
            queries::acquire_lock(&self.pool, execution_id, lock_key, acquired_at, expires_at),
        )
        .await
    }

    async fn release_lock(&self, execution_id: &str) -> Result<bool, StoreError> {
        self.timed("release_lock", queries::release_lock(&self.pool, execution_id))
            .await
    }

    async fn cleanup_expired_locks(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        self.timed(
            "cleanup_expired_locks",
            queries::cleanup_expired_locks(&self.pool, now),
        )
        .await
    }

    #[instrument(skip(self, f))]
    async fn transaction(&self, f: TxFn) -> Result<(), StoreError> {
        let tx = self.pool.begin().await.map_err(db_err)?;
        let view = PgTxStore {
            tx: tokio::sync::Mutex::new(tx),
        };

        match f(&view).await {
            Ok(()) => view.tx.into_inner().commit().await.map_err(db_err),
            Err(err) => {
                // Rollback failure is secondary; surface the original error
                let _ = view.tx.into_inner().rollback().await;
                Err(err)
            }
        }
    }
}

/// Store view scoped to one database transaction
///
/// Passed to `transaction(fn)` closures; every operation runs on the same
/// connection inside the transaction. Nested `transaction` calls join the
/// enclosing transaction.
struct PgTxStore {
    tx: tokio::sync::Mutex<Transaction<'static, Postgres>>,
}

#[async_trait]
impl WorkflowStore for PgTxStore {
    async fn create_definition(
        &self,
        definition: WorkflowDefinition,
    ) -> Result<WorkflowDefinition, StoreError> {
        let mut tx = self.tx.lock().await;
        queries::create_definition(&mut **tx, definition).await
    }

    async fn definition_by_id(&self, id: Uuid) -> Result<Option<WorkflowDefinition>, StoreError> {
        let mut tx = self.tx.lock().await;
        queries::definition_by_id(&mut **tx, id).await
    }

    async fn definition_by_name(
        &self,
        name: &str,
    ) -> Result<Option<WorkflowDefinition>, StoreError> {
        let mut tx = self.tx.lock().await;
        queries::definition_by_name(&mut **tx, name).await
    }

    async fn update_definition(
        &self,
        id: Uuid,
        patch: DefinitionPatch,
    ) -> Result<WorkflowDefinition, StoreError> {
        let mut tx = self.tx.lock().await;
        queries::update_definition(&mut **tx, id, patch).await
    }

    async fn list_active_definitions(&self) -> Result<Vec<WorkflowDefinition>, StoreError> {
        let mut tx = self.tx.lock().await;
        queries::list_active_definitions(&mut **tx).await
    }

    async fn create_execution(
        &self,
        execution: NewExecution,
    ) -> Result<WorkflowExecution, StoreError> {
        let mut tx = self.tx.lock().await;
        queries::create_execution(&mut **tx, execution).await
    }

    async fn execution_by_id(&self, id: &str) -> Result<Option<WorkflowExecution>, StoreError> {
        let mut tx = self.tx.lock().await;
        queries::execution_by_id(&mut **tx, id).await
    }

    async fn update_execution(
        &self,
        id: &str,
        patch: ExecutionPatch,
    ) -> Result<WorkflowExecution, StoreError> {
        let mut tx = self.tx.lock().await;
        queries::update_execution(&mut **tx, id, patch).await
    }

    async fn executions_by_name_and_status(
        &self,
        workflow_name: &str,
        status: ExecutionStatus,
    ) -> Result<Vec<WorkflowExecution>, StoreError> {
        let mut tx = self.tx.lock().await;
        queries::executions_by_name_and_status(&mut **tx, workflow_name, status).await
    }

    async fn resumable_executions(&self) -> Result<Vec<WorkflowExecution>, StoreError> {
        let mut tx = self.tx.lock().await;
        queries::resumable_executions(&mut **tx).await
    }

    async fn create_step(&self, step: NewStep) -> Result<StepExecution, StoreError> {
        let mut tx = self.tx.lock().await;
        queries::create_step(&mut **tx, step).await
    }

    async fn update_step(&self, id: Uuid, patch: StepPatch) -> Result<StepExecution, StoreError> {
        let mut tx = self.tx.lock().await;
        queries::update_step(&mut **tx, id, patch).await
    }

    async fn steps_by_execution(
        &self,
        execution_id: &str,
    ) -> Result<Vec<StepExecution>, StoreError> {
        let mut tx = self.tx.lock().await;
        queries::steps_by_execution(&mut **tx, execution_id).await
    }

    async fn step_by_execution_and_name(
        &self,
        execution_id: &str,
        step_name: &str,
    ) -> Result<Option<StepExecution>, StoreError> {
        let mut tx = self.tx.lock().await;
        queries::step_by_execution_and_name(&mut **tx, execution_id, step_name).await
    }

    async fn retryable_steps(
        &self,
        execution_id: &str,
    ) -> Result<Vec<StepExecution>, StoreError> {
        let mut tx = self.tx.lock().await;
        queries::retryable_steps(&mut **tx, execution_id).await
    }

    async fn circuit_get_or_create(
        &self,
        name: &str,
    ) -> Result<CircuitBreakerRecord, StoreError> {
        let mut tx = self.tx.lock().await;
        queries::circuit_get_or_create(&mut **tx, name).await
    }

    async fn update_circuit(
        &self,
        name: &str,
        patch: CircuitPatch,
    ) -> Result<CircuitBreakerRecord, StoreError> {
        let mut tx = self.tx.lock().await;
        queries::update_circuit(&mut **tx, name, patch).await
    }

    async fn reset_circuit(&self, name: &str) -> Result<CircuitBreakerRecord, StoreError> {
        let mut tx = self.tx.lock().await;
        queries::update_circuit(
            &mut **tx,
            name,
            CircuitPatch {
                state: crate::reliability::CircuitState::Closed,
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
        let mut tx = self.tx.lock().await;
        queries::acquire_lock(&mut **tx, execution_id, lock_key, acquired_at, expires_at).await
    }

    async fn release_lock(&self, execution_id: &str) -> Result<bool, StoreError> {
        let mut tx = self.tx.lock().await;
        queries::release_lock(&mut **tx, execution_id).await
    }

    async fn cleanup_expired_locks(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut tx = self.tx.lock().await;
        queries::cleanup_expired_locks(&mut **tx, now).await
    }

    async fn transaction(&self, f: TxFn) -> Result<(), StoreError> {
        // Already inside a transaction; the closure joins it
        f(self).await
    }
}
