//! Workflow error taxonomy
//!
//! Errors are classified by *kind*, not by language-level type: retry and
//! error-handler dispatch operate on [`ErrorKind`], and errors round-trip
//! through the JSON `error` columns of the store.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::persistence::StoreError;

/// Discriminator over the error taxonomy
///
/// Step policies register recovery handlers keyed by kind; the step runner
/// dispatches on [`WorkflowError::kind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Invalid input or state supplied by the user
    Validation,

    /// A downstream service call failed (transient, retryable)
    ExternalService,

    /// A step or workflow exceeded its timeout (transient, retryable)
    Timeout,

    /// A circuit breaker rejected the call
    CircuitOpen,

    /// The execution was cancelled
    Cancelled,

    /// No handler registered under the requested workflow name
    UnknownWorkflow,

    /// The execution's lock is held by another process or task
    AlreadyRunning,

    /// The execution is in a status that cannot be resumed
    NotResumable,

    /// The execution does not exist
    ExecutionNotFound,

    /// Application-defined failure raised by a step body
    App,

    /// Storage I/O failure (fatal for the current run)
    Storage,
}

impl ErrorKind {
    /// Stable string form, matching the serialized `kind` tag
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::ExternalService => "external_service",
            Self::Timeout => "timeout",
            Self::CircuitOpen => "circuit_open",
            Self::Cancelled => "cancelled",
            Self::UnknownWorkflow => "unknown_workflow",
            Self::AlreadyRunning => "already_running",
            Self::NotResumable => "not_resumable",
            Self::ExecutionNotFound => "execution_not_found",
            Self::App => "app",
            Self::Storage => "storage",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error surfaced by workflow and step execution
///
/// Serializes with a `kind` tag so failure rows persisted by the store can
/// be deserialized back into the same variant on replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkflowError {
    /// Invalid input or state
    #[error("validation failed for field '{field}': {message}")]
    Validation { field: String, message: String },

    /// Downstream service failure
    #[error("external service '{service}' failed during '{operation}': {message}")]
    ExternalService {
        service: String,
        operation: String,
        message: String,
    },

    /// Timeout racing a step body or workflow handler
    #[error("timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// Circuit breaker rejected the call
    #[error("circuit breaker '{name}' is open")]
    CircuitOpen { name: String },

    /// Execution was cancelled
    #[error("execution '{execution_id}' was cancelled")]
    Cancelled { execution_id: String },

    /// No handler registered under this name
    #[error("unknown workflow: '{name}'")]
    UnknownWorkflow { name: String },

    /// Another process or task holds the execution lock
    #[error("execution '{execution_id}' is already running")]
    AlreadyRunning { execution_id: String },

    /// Resume called on a terminal or pending execution
    #[error("execution '{execution_id}' is {status} and cannot be resumed")]
    NotResumable {
        execution_id: String,
        status: String,
    },

    /// Execution does not exist
    #[error("execution not found: '{execution_id}'")]
    ExecutionNotFound { execution_id: String },

    /// Application-defined failure from a step body
    #[error("{message}")]
    App {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<Value>,
    },

    /// Storage I/O failure
    #[error("storage failure: {message}")]
    Storage { message: String },
}

impl WorkflowError {
    /// Classify this error for handler dispatch
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation { .. } => ErrorKind::Validation,
            Self::ExternalService { .. } => ErrorKind::ExternalService,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
            Self::UnknownWorkflow { .. } => ErrorKind::UnknownWorkflow,
            Self::AlreadyRunning { .. } => ErrorKind::AlreadyRunning,
            Self::NotResumable { .. } => ErrorKind::NotResumable,
            Self::ExecutionNotFound { .. } => ErrorKind::ExecutionNotFound,
            Self::App { .. } => ErrorKind::App,
            Self::Storage { .. } => ErrorKind::Storage,
        }
    }

    /// Validation error for a named field
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Transient failure of a downstream service operation
    pub fn external_service(
        service: impl Into<String>,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::ExternalService {
            service: service.into(),
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Application-defined failure
    pub fn app(message: impl Into<String>) -> Self {
        Self::App {
            message: message.into(),
            details: None,
        }
    }

    /// Application-defined failure with a structured payload
    pub fn app_with_details(message: impl Into<String>, details: Value) -> Self {
        Self::App {
            message: message.into(),
            details: Some(details),
        }
    }

    /// Serialize for a store `error` column; falls back to a bare message
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| Value::String(self.to_string()))
    }
}

impl From<StoreError> for WorkflowError {
    fn from(err: StoreError) -> Self {
        Self::Storage {
            message: err.to_string(),
        }
    }
}
