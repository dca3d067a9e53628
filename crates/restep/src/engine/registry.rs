//! Process-wide handler registry

use std::sync::Arc;

use dashmap::DashMap;

use crate::workflow::{WorkflowHandler, WorkflowOptions};

/// A handler plus its registration options
pub(crate) struct RegisteredWorkflow {
    pub name: String,
    pub handler: WorkflowHandler,
    pub options: WorkflowOptions,
}

/// Name → handler mapping, safe under concurrent registration and lookup
pub(crate) struct HandlerRegistry {
    handlers: DashMap<String, Arc<RegisteredWorkflow>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: DashMap::new(),
        }
    }

    /// Register a handler; re-registration replaces the previous entry
    pub fn register(&self, name: &str, handler: WorkflowHandler, options: WorkflowOptions) {
        self.handlers.insert(
            name.to_string(),
            Arc::new(RegisteredWorkflow {
                name: name.to_string(),
                handler,
                options,
            }),
        );
    }

    pub fn get(&self, name: &str) -> Option<Arc<RegisteredWorkflow>> {
        self.handlers.get(name).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.handlers.iter().map(|e| e.key().clone()).collect()
    }
}
