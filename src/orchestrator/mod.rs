//! Round-based DAG execution of workflow plans.
//!
//! Each round computes every step whose dependencies have completed, runs
//! them concurrently against one state snapshot, waits for all of them,
//! then merges their outputs into the plan state. A step whose own
//! dependencies finished early still waits for its round; in exchange,
//! completion bookkeeping and state visibility stay simple.
//!
//! A plan is executed once. Failure is terminal: steps not yet started are
//! abandoned and nothing resumes a failed plan.

pub mod state;
pub mod tools;

pub use state::{ExecutionState, Outputs, StateSnapshot};
pub use tools::{FnTool, Tool, ToolRegistry, tool_fn};

use opentelemetry::KeyValue;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinSet;
use tracing::{Instrument, debug, info, warn};

use crate::error::{Error, Result};
use crate::model::{Step, WorkflowPlan};
use crate::telemetry::metrics;
use crate::telemetry::plan::{record_plan_outcome, start_plan_span, start_step_span};

/// Lifecycle of one plan instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Ready,
    Executing,
    Completed,
    Failed,
}

impl PlanStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PlanStatus::Ready => "ready",
            PlanStatus::Executing => "executing",
            PlanStatus::Completed => "completed",
            PlanStatus::Failed => "failed",
        }
    }
}

/// What a completed plan produced.
#[derive(Debug, Clone, Serialize)]
pub struct PlanReport {
    pub plan_id: String,
    pub status: PlanStatus,
    /// Step ids executed in each round, in plan order.
    pub rounds: Vec<Vec<String>>,
    /// Final contents of the plan's state store.
    pub state: HashMap<String, serde_json::Value>,
    pub duration_ms: u64,
}

/// Executes plans against a tool registry.
#[derive(Clone)]
pub struct Orchestrator {
    tools: Arc<ToolRegistry>,
}

impl Orchestrator {
    pub fn new(tools: Arc<ToolRegistry>) -> Self {
        Self { tools }
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    /// Execute a plan with an empty state store.
    pub async fn execute(&self, plan: &WorkflowPlan) -> Result<PlanReport> {
        self.execute_with(plan, ExecutionState::new()).await
    }

    /// Execute a plan with a pre-seeded state store.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidPlan`] if the plan is malformed or uses an action
    ///   with no registered tool. Nothing runs.
    /// - [`Error::UnresolvableDependencies`] if steps remain but none is
    ///   runnable (a cycle, or a dependency on a missing step).
    /// - [`Error::StepFailed`] if any tool call fails; its round's other
    ///   steps are cancelled and later rounds never start.
    pub async fn execute_with(
        &self,
        plan: &WorkflowPlan,
        initial: ExecutionState,
    ) -> Result<PlanReport> {
        self.tools.validate(plan)?;

        let span = start_plan_span(&plan.plan_id, plan.steps.len());
        let started = Instant::now();
        let mut rounds = Vec::new();

        let result = self
            .run_rounds(plan, initial, &mut rounds)
            .instrument(span.clone())
            .await;

        let status = if result.is_ok() {
            PlanStatus::Completed
        } else {
            PlanStatus::Failed
        };
        record_plan_outcome(&span, status.as_str(), rounds.len());
        metrics::operation_duration_ms().record(
            started.elapsed().as_millis() as f64,
            &[KeyValue::new("operation", "plan.execute")],
        );

        let state = result.inspect_err(|e| {
            span.in_scope(|| warn!(plan_id = %plan.plan_id, error = %e, "plan failed"));
        })?;

        span.in_scope(|| {
            info!(plan_id = %plan.plan_id, rounds = rounds.len(), "plan completed");
        });
        Ok(PlanReport {
            plan_id: plan.plan_id.clone(),
            status,
            rounds,
            state: state.into_values(),
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }

    async fn run_rounds(
        &self,
        plan: &WorkflowPlan,
        mut state: ExecutionState,
        rounds: &mut Vec<Vec<String>>,
    ) -> Result<ExecutionState> {
        let mut completed: HashSet<&str> = HashSet::new();
        debug!(
            plan_id = %plan.plan_id,
            from = PlanStatus::Ready.as_str(),
            to = PlanStatus::Executing.as_str(),
            "plan status"
        );

        while completed.len() < plan.steps.len() {
            let ready: Vec<&Step> = plan
                .steps
                .iter()
                .filter(|s| {
                    !completed.contains(s.step_id.as_str())
                        && s.dependencies.iter().all(|d| completed.contains(d.as_str()))
                })
                .collect();

            if ready.is_empty() {
                let pending = plan
                    .steps
                    .iter()
                    .filter(|s| !completed.contains(s.step_id.as_str()))
                    .map(|s| s.step_id.clone())
                    .collect();
                metrics::plan_rounds().add(1, &[KeyValue::new("outcome", "failed")]);
                return Err(Error::UnresolvableDependencies {
                    plan_id: plan.plan_id.clone(),
                    pending,
                });
            }

            let round = rounds.len() + 1;
            let outputs = match self.run_round(&ready, &state, round).await {
                Ok(outputs) => outputs,
                Err(e) => {
                    metrics::plan_rounds().add(1, &[KeyValue::new("outcome", "failed")]);
                    return Err(e);
                }
            };

            // Merge in plan order so overlapping keys resolve the same way
            // every run.
            for (step, out) in ready.iter().zip(outputs) {
                state.merge(out);
                completed.insert(step.step_id.as_str());
            }
            rounds.push(ready.iter().map(|s| s.step_id.clone()).collect());
            metrics::plan_rounds().add(1, &[KeyValue::new("outcome", "completed")]);
            debug!(round, steps = ready.len(), "round completed");
        }

        Ok(state)
    }

    /// Run one round's steps concurrently. Returns outputs in `ready` order.
    async fn run_round(
        &self,
        ready: &[&Step],
        state: &ExecutionState,
        round: usize,
    ) -> Result<Vec<Outputs>> {
        let snapshot = state.snapshot();
        let mut set = JoinSet::new();
        let mut task_steps = HashMap::new();

        for (idx, step) in ready.iter().enumerate() {
            let tool = self.tools.get(step.action).ok_or_else(|| {
                Error::InvalidPlan(format!("no tool registered for action {}", step.action))
            })?;
            let parameters = step.parameters.clone();
            let snapshot = snapshot.clone();
            let span = start_step_span(&step.step_id, step.action.as_str(), round);

            let handle = set.spawn(
                async move { (idx, tool.call(&parameters, &snapshot).await) }.instrument(span),
            );
            task_steps.insert(handle.id(), idx);
        }

        let mut outputs: Vec<Option<Outputs>> = vec![None; ready.len()];
        while let Some(joined) = set.join_next().await {
            let failure = match joined {
                Ok((idx, Ok(out))) => {
                    outputs[idx] = Some(out);
                    continue;
                }
                Ok((idx, Err(e))) => (idx, e.to_string()),
                Err(e) => {
                    let idx = task_steps.get(&e.id()).copied().unwrap_or_default();
                    (idx, format!("step task aborted: {e}"))
                }
            };

            set.abort_all();
            let (idx, message) = failure;
            return Err(Error::StepFailed {
                step_id: ready[idx].step_id.clone(),
                message,
            });
        }

        Ok(outputs.into_iter().map(Option::unwrap_or_default).collect())
    }
}
