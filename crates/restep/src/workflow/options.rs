//! Registration and start options

use std::time::Duration;

use serde_json::Value;

use crate::reliability::RetryPolicy;

/// Options attached to a workflow registration
///
/// # Example
///
/// ```
/// use restep::{RetryPolicy, WorkflowOptions};
/// use std::time::Duration;
///
/// let options = WorkflowOptions::default()
///     .with_version("2.1.0")
///     .with_description("nightly billing sweep")
///     .with_retry(RetryPolicy::default().with_max_attempts(2))
///     .with_timeout(Duration::from_secs(600));
/// ```
#[derive(Debug, Clone)]
pub struct WorkflowOptions {
    /// Definition version (semver); re-registration with a new version
    /// updates the stored definition
    pub version: String,

    /// Human-readable description, stored on the definition row
    pub description: Option<String>,

    /// Opaque input schema blob, stored on the definition row
    pub schema: Option<Value>,

    /// Workflow-level retry: the whole handler re-runs on failure, with
    /// completed steps memoized across attempts
    pub retry: Option<RetryPolicy>,

    /// Workflow-level timeout racing the handler
    pub timeout: Option<Duration>,
}

impl Default for WorkflowOptions {
    fn default() -> Self {
        Self {
            version: "1.0.0".to_string(),
            description: None,
            schema: None,
            retry: None,
            timeout: None,
        }
    }
}

impl WorkflowOptions {
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_schema(mut self, schema: Value) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Options for starting an execution
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    /// Caller metadata stored on the execution row and exposed on the context
    pub metadata: Option<Value>,
}

impl StartOptions {
    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}
