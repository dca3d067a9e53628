//! Store observability sidecar
//!
//! Operator-facing counters: per-operation invocation stats and a bounded
//! ring of slow queries. Not part of the `WorkflowStore` contract.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

/// Queries at or above this duration land in the slow-query ring
pub const SLOW_QUERY_THRESHOLD: Duration = Duration::from_millis(50);

/// Capacity of the slow-query ring buffer
pub const SLOW_QUERY_CAPACITY: usize = 50;

/// One slow query observation
#[derive(Debug, Clone, Serialize)]
pub struct SlowQuery {
    pub operation: String,
    pub duration_ms: u64,
    pub recorded_at: DateTime<Utc>,
}

/// Aggregate stats for one store operation
#[derive(Debug, Clone, Serialize)]
pub struct OperationMetrics {
    pub operation: String,
    pub count: u64,
    pub total_ms: u64,
    pub max_ms: u64,
}

/// Snapshot returned by `performance_metrics()`
#[derive(Debug, Clone, Default, Serialize)]
pub struct PerformanceMetrics {
    pub operations: Vec<OperationMetrics>,
    pub slow_queries: Vec<SlowQuery>,
}

/// Row counts returned by `stats()`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub definitions: u64,
    pub executions: u64,
    pub steps: u64,
    pub circuit_breakers: u64,
    pub locks: u64,
}

#[derive(Default)]
struct OpCounters {
    count: u64,
    total_ms: u64,
    max_ms: u64,
}

/// Collector shared by the concrete stores
pub struct QueryMetrics {
    operations: Mutex<HashMap<&'static str, OpCounters>>,
    slow: Mutex<VecDeque<SlowQuery>>,
}

impl QueryMetrics {
    pub fn new() -> Self {
        Self {
            operations: Mutex::new(HashMap::new()),
            slow: Mutex::new(VecDeque::with_capacity(SLOW_QUERY_CAPACITY)),
        }
    }

    /// Record one operation invocation
    pub fn record(&self, operation: &'static str, duration: Duration) {
        let millis = duration.as_millis() as u64;

        {
            let mut ops = self.operations.lock();
            let counters = ops.entry(operation).or_default();
            counters.count += 1;
            counters.total_ms += millis;
            counters.max_ms = counters.max_ms.max(millis);
        }

        if duration >= SLOW_QUERY_THRESHOLD {
            let mut slow = self.slow.lock();
            if slow.len() == SLOW_QUERY_CAPACITY {
                slow.pop_front();
            }
            slow.push_back(SlowQuery {
                operation: operation.to_string(),
                duration_ms: millis,
                recorded_at: Utc::now(),
            });
        }
    }

    /// Current metrics, operations sorted by name
    pub fn snapshot(&self) -> PerformanceMetrics {
        let mut operations: Vec<OperationMetrics> = self
            .operations
            .lock()
            .iter()
            .map(|(op, c)| OperationMetrics {
                operation: op.to_string(),
                count: c.count,
                total_ms: c.total_ms,
                max_ms: c.max_ms,
            })
            .collect();
        operations.sort_by(|a, b| a.operation.cmp(&b.operation));

        PerformanceMetrics {
            operations,
            slow_queries: self.slow.lock().iter().cloned().collect(),
        }
    }
}

impl Default for QueryMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_snapshot() {
        let metrics = QueryMetrics::new();
        metrics.record("create_step", Duration::from_millis(2));
        metrics.record("create_step", Duration::from_millis(8));
        metrics.record("update_step", Duration::from_millis(1));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.operations.len(), 2);

        let create = &snapshot.operations[0];
        assert_eq!(create.operation, "create_step");
        assert_eq!(create.count, 2);
        assert_eq!(create.max_ms, 8);
    }

    #[test]
    fn test_slow_queries_captured_above_threshold() {
        let metrics = QueryMetrics::new();
        metrics.record("fast", Duration::from_millis(10));
        metrics.record("slow", Duration::from_millis(75));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.slow_queries.len(), 1);
        assert_eq!(snapshot.slow_queries[0].operation, "slow");
    }

    #[test]
    fn test_slow_query_ring_is_bounded() {
        let metrics = QueryMetrics::new();
        for _ in 0..(SLOW_QUERY_CAPACITY + 20) {
            metrics.record("slow", Duration::from_millis(60));
        }

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.slow_queries.len(), SLOW_QUERY_CAPACITY);
    }
}
