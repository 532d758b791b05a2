//! Per-plan shared state.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Tool outputs: named values merged into the plan's state.
pub type Outputs = serde_json::Map<String, Value>;

/// Flat key/value store scoped to one plan instance.
///
/// Only the orchestrator driving the plan writes to it, between rounds.
/// Steps see an immutable [`StateSnapshot`] taken at the start of their
/// round, so every step in a round observes the same values.
#[derive(Debug, Clone, Default)]
pub struct ExecutionState {
    values: HashMap<String, Value>,
}

impl ExecutionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store, e.g. with the job's message.
    pub fn with(mut self, key: impl Into<String>, value: Value) -> Self {
        self.values.insert(key.into(), value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.values.insert(key.into(), value);
    }

    /// Write a step's outputs. Later writes to the same key win.
    pub fn merge(&mut self, outputs: Outputs) {
        self.values.extend(outputs);
    }

    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot(Arc::new(self.values.clone()))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn into_values(self) -> HashMap<String, Value> {
        self.values
    }
}

/// Read-only view of plan state handed to tools.
#[derive(Debug, Clone, Default)]
pub struct StateSnapshot(Arc<HashMap<String, Value>>);

impl StateSnapshot {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }
}
