//! Workflow plans: steps with dependencies, executed by the orchestrator.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};

use crate::error::{Error, Result};

/// A multi-step processing plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowPlan {
    pub plan_id: String,
    pub steps: Vec<Step>,
}

/// One step of a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub step_id: String,
    /// Which tool to invoke.
    pub action: Action,
    /// Tool arguments. Opaque to the orchestrator.
    #[serde(default)]
    pub parameters: serde_json::Value,
    /// Steps that must complete before this one runs.
    #[serde(default)]
    pub dependencies: BTreeSet<String>,
}

impl Step {
    pub fn new(step_id: impl Into<String>, action: Action) -> Self {
        Self {
            step_id: step_id.into(),
            action,
            parameters: serde_json::Value::Null,
            dependencies: BTreeSet::new(),
        }
    }

    pub fn parameters(mut self, parameters: serde_json::Value) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies.extend(deps.into_iter().map(Into::into));
        self
    }
}

/// The closed set of tools a step can invoke.
///
/// Unknown tags fail deserialization, so a plan naming a tool that doesn't
/// exist is rejected before anything runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Ask the completion provider for text.
    Complete,
    /// Reshape text or data into a presentation format.
    Format,
    /// Assign labels or categories.
    Categorize,
    /// Store results somewhere durable.
    Persist,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Complete => "complete",
            Action::Format => "format",
            Action::Categorize => "categorize",
            Action::Persist => "persist",
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl WorkflowPlan {
    pub fn new(plan_id: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            plan_id: plan_id.into(),
            steps,
        }
    }

    /// Parse a plan from JSON, mapping decode failures (including unknown
    /// action tags) to `InvalidPlan`.
    pub fn from_json(value: serde_json::Value) -> Result<Self> {
        serde_json::from_value(value).map_err(|e| Error::InvalidPlan(e.to_string()))
    }

    /// Structural checks: step ids are non-empty and unique. A plan with no
    /// steps is valid and completes without running any round.
    ///
    /// Dependency problems (cycles, unknown step ids) are detected by the
    /// executor when no step can make progress.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for step in &self.steps {
            if step.step_id.is_empty() {
                return Err(Error::InvalidPlan(format!(
                    "plan {} has a step with an empty id",
                    self.plan_id
                )));
            }
            if !seen.insert(step.step_id.as_str()) {
                return Err(Error::InvalidPlan(format!(
                    "plan {} has duplicate step id {}",
                    self.plan_id, step.step_id
                )));
            }
        }
        Ok(())
    }

    /// Actions used by this plan, deduplicated.
    pub fn actions(&self) -> BTreeSet<Action> {
        self.steps.iter().map(|s| s.action).collect()
    }
}
