//! Tool dispatch table: one tool per [`Action`].

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use super::state::{Outputs, StateSnapshot};
use crate::error::{Error, Result};
use crate::model::{Action, WorkflowPlan};

/// An external tool a step can invoke. What it does is its own business;
/// the orchestrator only threads parameters, state and outputs.
#[async_trait]
pub trait Tool: Send + Sync {
    async fn call(&self, parameters: &Value, state: &StateSnapshot) -> Result<Outputs>;
}

/// Maps each action to the tool that implements it.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: HashMap<Action, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `tool` for `action`, replacing any previous one.
    pub fn register(mut self, action: Action, tool: impl Tool + 'static) -> Self {
        self.tools.insert(action, Arc::new(tool));
        self
    }

    pub fn register_arc(mut self, action: Action, tool: Arc<dyn Tool>) -> Self {
        self.tools.insert(action, tool);
        self
    }

    pub fn get(&self, action: Action) -> Option<Arc<dyn Tool>> {
        self.tools.get(&action).cloned()
    }

    /// Reject plans that are malformed or name an action with no tool.
    pub fn validate(&self, plan: &WorkflowPlan) -> Result<()> {
        plan.validate()?;
        for step in &plan.steps {
            if !self.tools.contains_key(&step.action) {
                return Err(Error::InvalidPlan(format!(
                    "step {} uses action {} which has no registered tool",
                    step.step_id, step.action
                )));
            }
        }
        Ok(())
    }
}

/// A tool built from an async closure.
pub struct FnTool<F> {
    f: F,
}

/// Adapt an async closure into a [`Tool`].
///
/// ```
/// use relay_rs::orchestrator::{Outputs, tool_fn};
///
/// let upper = tool_fn(|params, _state| async move {
///     let text = params["text"].as_str().unwrap_or_default().to_uppercase();
///     let mut out = Outputs::new();
///     out.insert("upper".into(), text.into());
///     Ok::<_, relay_rs::Error>(out)
/// });
/// # let _ = upper;
/// ```
pub fn tool_fn<F, Fut>(f: F) -> FnTool<F>
where
    F: Fn(Value, StateSnapshot) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Outputs>> + Send,
{
    FnTool { f }
}

#[async_trait]
impl<F, Fut> Tool for FnTool<F>
where
    F: Fn(Value, StateSnapshot) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Outputs>> + Send,
{
    async fn call(&self, parameters: &Value, state: &StateSnapshot) -> Result<Outputs> {
        (self.f)(parameters.clone(), state.clone()).await
    }
}
