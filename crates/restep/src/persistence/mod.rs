//! Durable persistence: records, store trait, and implementations

mod memory;
mod metrics;
mod postgres;
mod records;
mod store;

pub use memory::MemoryStore;
pub use metrics::{
    OperationMetrics, PerformanceMetrics, QueryMetrics, SlowQuery, StoreStats,
    SLOW_QUERY_CAPACITY, SLOW_QUERY_THRESHOLD,
};
pub use postgres::PostgresStore;
pub use records::{
    normalize_json, CircuitBreakerRecord, CircuitPatch, DefinitionPatch, ExecutionPatch,
    ExecutionStatus, NewExecution, NewStep, StepExecution, StepPatch, StepStatus,
    WorkflowDefinition, WorkflowExecution, WorkflowLock,
};
pub use store::{boxed_tx, StoreError, TxFn, WorkflowStore};
