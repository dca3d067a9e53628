//! Persisted records and patch types
//!
//! One struct per table. JSON-valued fields are opaque `serde_json::Value`
//! blobs; `null` is normalized to absent on read so optional fields are
//! either present-with-value or absent.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::reliability::CircuitState;

/// Workflow execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Execution created but not started
    Pending,

    /// Handler is (or was, if the process died) in flight
    Running,

    /// Handler returned normally
    Completed,

    /// Handler threw and no recovery intercepted
    Failed,

    /// Parked by an operator; resumable
    Paused,

    /// Cancelled; step calls refuse from here on
    Cancelled,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Paused => "paused",
            Self::Cancelled => "cancelled",
        }
    }

    /// Whether `resume` may re-enter this execution
    pub fn is_resumable(&self) -> bool {
        matches!(self, Self::Running | Self::Paused | Self::Failed)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "paused" => Ok(Self::Paused),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown execution status: {other}")),
        }
    }
}

/// Step execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    Retrying,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Retrying => "retrying",
        }
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StepStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            "retrying" => Ok(Self::Retrying),
            other => Err(format!("unknown step status: {other}")),
        }
    }
}

/// Registered workflow definition
///
/// Created when a handler is registered; re-registration bumps the version.
/// Soft-deleted via `is_active = false`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: Uuid,
    pub name: String,
    pub version: String,
    pub description: Option<String>,
    pub schema: Option<Value>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One instance of a workflow; the id is caller-supplied
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub id: String,
    pub definition_id: Uuid,
    pub workflow_name: String,
    pub status: ExecutionStatus,
    pub input: Option<Value>,
    pub output: Option<Value>,
    pub error: Option<Value>,
    pub metadata: Option<Value>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One step of an execution; mutated across retries, never deleted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepExecution {
    pub id: Uuid,
    pub execution_id: String,
    pub step_name: String,
    pub status: StepStatus,
    pub input: Option<Value>,
    pub output: Option<Value>,
    pub error: Option<Value>,
    pub attempt: u32,
    pub max_attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StepExecution {
    /// A step is retryable iff it failed with attempts remaining
    pub fn is_retryable(&self) -> bool {
        self.status == StepStatus::Failed && self.attempt < self.max_attempts
    }
}

/// Named circuit breaker state, created lazily on first use
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerRecord {
    pub id: Uuid,
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Per-execution mutual exclusion row
///
/// Valid iff `now < expires_at`; an expired lock is semantically absent and
/// reclaimed by cleanup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowLock {
    pub id: Uuid,
    pub execution_id: String,
    pub lock_key: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub metadata: Option<Value>,
}

impl WorkflowLock {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Fields for creating an execution row
#[derive(Debug, Clone)]
pub struct NewExecution {
    pub id: String,
    pub definition_id: Uuid,
    pub workflow_name: String,
    pub status: ExecutionStatus,
    pub input: Option<Value>,
    pub metadata: Option<Value>,
}

/// Fields for creating a step row
#[derive(Debug, Clone)]
pub struct NewStep {
    pub id: Uuid,
    pub execution_id: String,
    pub step_name: String,
    pub status: StepStatus,
    pub input: Option<Value>,
    pub attempt: u32,
    pub max_attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
}

/// Partial update of a definition; absent fields are left unchanged
#[derive(Debug, Clone, Default)]
pub struct DefinitionPatch {
    pub version: Option<String>,
    pub description: Option<String>,
    pub schema: Option<Value>,
    pub is_active: Option<bool>,
}

/// Partial update of an execution; absent fields are left unchanged
#[derive(Debug, Clone, Default)]
pub struct ExecutionPatch {
    pub status: Option<ExecutionStatus>,
    pub input: Option<Value>,
    pub output: Option<Value>,
    pub error: Option<Value>,
    pub metadata: Option<Value>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Partial update of a step; absent fields are left unchanged
#[derive(Debug, Clone, Default)]
pub struct StepPatch {
    pub status: Option<StepStatus>,
    pub input: Option<Value>,
    pub output: Option<Value>,
    pub error: Option<Value>,
    pub attempt: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Full replacement of a breaker's mutable fields
///
/// The breaker state machine always writes the complete transition, so the
/// patch carries every mutable column (including explicit clears).
#[derive(Debug, Clone)]
pub struct CircuitPatch {
    pub state: CircuitState,
    pub failure_count: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub next_attempt_at: Option<DateTime<Utc>>,
}

/// Normalize a stored JSON field: explicit `null` reads as absent
pub fn normalize_json(value: Option<Value>) -> Option<Value> {
    match value {
        None | Some(Value::Null) => None,
        some => some,
    }
}
