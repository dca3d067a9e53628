//! In-process step-result cache
//!
//! LRU over `(execution_id, step_name, hash(input))` with a TTL, used to
//! accelerate same-process replay. Purely an optimization: durability is
//! always the store's job, and a miss just falls through to it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;

use crate::clock::Clock;

/// Cache sizing and expiry
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Entry cap; least-recently-accessed entries are evicted beyond it
    pub max_size: usize,

    /// Entries older than this are treated as absent
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: 1000,
            ttl: Duration::from_secs(300),
        }
    }
}

impl CacheConfig {
    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size.max(1);
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }
}

/// Cache key: one entry per step invocation shape
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub execution_id: String,
    pub step_name: String,
    pub input_hash: String,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Value,
    inserted_at: DateTime<Utc>,
    last_access: DateTime<Utc>,
}

/// Step-result cache shared by all executions in the process
pub struct StepResultCache {
    config: CacheConfig,
    clock: Arc<dyn Clock>,
    entries: Mutex<HashMap<CacheKey, CacheEntry>>,
}

impl StepResultCache {
    pub fn new(config: CacheConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Fetch a cached result, expiring stale entries on the way
    pub fn get(&self, key: &CacheKey) -> Option<Value> {
        let now = self.clock.now();
        let ttl = chrono::Duration::milliseconds(self.config.ttl.as_millis() as i64);
        let mut entries = self.entries.lock();

        match entries.get_mut(key) {
            Some(entry) if now - entry.inserted_at < ttl => {
                entry.last_access = now;
                Some(entry.value.clone())
            }
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    /// Insert a result, evicting the least-recently-accessed entry when full
    pub fn insert(&self, key: CacheKey, value: Value) {
        let now = self.clock.now();
        let mut entries = self.entries.lock();

        if !entries.contains_key(&key) && entries.len() >= self.config.max_size {
            let coldest = entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_access)
                .map(|(k, _)| k.clone());
            if let Some(coldest) = coldest {
                entries.remove(&coldest);
            }
        }

        entries.insert(
            key,
            CacheEntry {
                value,
                inserted_at: now,
                last_access: now,
            },
        );
    }

    /// Drop every entry for one execution (called on terminal transitions)
    pub fn invalidate_execution(&self, execution_id: &str) {
        self.entries
            .lock()
            .retain(|key, _| key.execution_id != execution_id);
    }

    /// Drop every entry for one step name across executions (rollouts)
    pub fn invalidate_step(&self, step_name: &str) {
        self.entries
            .lock()
            .retain(|key, _| key.step_name != step_name);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
