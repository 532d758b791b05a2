//! Built-in job handlers: streamed completion and multi-step plans.

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::llm::{CompletionProvider, CompletionRequest};
use crate::model::{Job, WorkflowPlan};
use crate::orchestrator::{ExecutionState, Orchestrator, Outputs, PlanReport, StateSnapshot, Tool};
use crate::results::ChunkSink;
use crate::worker::JobHandler;

/// Job type for a single chat message answered by the completion provider.
pub const CHAT_JOB: &str = "chat";

/// Job type for a multi-step workflow plan carried in `payload.plan`.
pub const PLAN_JOB: &str = "plan";

fn completion_request(job: &Job, message: String) -> CompletionRequest {
    CompletionRequest {
        client_id: job.client_id.clone(),
        conversation_id: job.conversation_id.clone(),
        message,
        metadata: job.payload.get("metadata").cloned().unwrap_or(Value::Null),
    }
}

// ---------------------------------------------------------------------------
// Completion
// ---------------------------------------------------------------------------

/// Republishes each completion fragment as a result chunk, then an empty
/// final chunk.
pub struct CompletionHandler {
    provider: Arc<dyn CompletionProvider>,
}

impl CompletionHandler {
    pub fn new(provider: Arc<dyn CompletionProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl JobHandler for CompletionHandler {
    async fn handle(&self, job: &Job, sink: &ChunkSink) -> Result<()> {
        let message = job
            .message()
            .ok_or_else(|| Error::Other(format!("job {} has no message", job.id)))?;

        let mut fragments = self
            .provider
            .stream(completion_request(job, message.to_string()))
            .await?;
        while let Some(fragment) = fragments.next().await {
            sink.send(&fragment?).await?;
        }
        sink.finish("").await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Plans
// ---------------------------------------------------------------------------

/// Executes the plan in `payload.plan` and publishes a JSON summary as the
/// final chunk.
///
/// Plan failures are reported to the client as a structured failure chunk
/// and the job completes normally: a failed plan is terminal and is never
/// retried. Only infrastructure errors (publishing the chunk) fail the job.
pub struct PlanHandler {
    orchestrator: Orchestrator,
}

impl PlanHandler {
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self { orchestrator }
    }

    async fn execute(&self, job: &Job) -> Result<PlanReport> {
        let plan = job
            .payload
            .get("plan")
            .cloned()
            .ok_or_else(|| Error::InvalidPlan(format!("job {} carries no plan", job.id)))
            .and_then(WorkflowPlan::from_json)?;

        let mut state =
            ExecutionState::new().with("client_id", Value::String(job.client_id.clone()));
        if let Some(message) = job.message() {
            state.insert("message", Value::String(message.to_string()));
        }
        if let Some(metadata) = job.payload.get("metadata") {
            state.insert("metadata", metadata.clone());
        }
        self.orchestrator.execute_with(&plan, state).await
    }
}

#[async_trait]
impl JobHandler for PlanHandler {
    async fn handle(&self, job: &Job, sink: &ChunkSink) -> Result<()> {
        let plan_id = job
            .payload
            .pointer("/plan/plan_id")
            .cloned()
            .unwrap_or(Value::Null);

        let summary = match self.execute(job).await {
            Ok(report) => {
                debug!(job_id = %job.id, plan_id = %report.plan_id, "plan job completed");
                json!({
                    "status": report.status,
                    "plan_id": report.plan_id,
                    "rounds": report.rounds,
                    "state": report.state,
                })
            }
            Err(e) => {
                warn!(job_id = %job.id, code = e.code(), error = %e, "plan job failed");
                json!({
                    "status": "failed",
                    "plan_id": plan_id,
                    "code": e.code(),
                    "error": e.to_string(),
                })
            }
        };
        sink.finish(&summary.to_string()).await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Complete tool
// ---------------------------------------------------------------------------

/// Orchestrator tool for [`Action::Complete`](crate::model::Action::Complete).
///
/// Parameters:
/// - `prompt`: literal prompt text, or
/// - `input_key`: state key holding the prompt (default `"message"`);
/// - `output_key`: state key the answer is written to (default `"text"`).
pub struct CompletionTool {
    provider: Arc<dyn CompletionProvider>,
}

impl CompletionTool {
    pub fn new(provider: Arc<dyn CompletionProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl Tool for CompletionTool {
    async fn call(&self, parameters: &Value, state: &StateSnapshot) -> Result<Outputs> {
        let prompt = match parameters.get("prompt").and_then(Value::as_str) {
            Some(prompt) => prompt.to_string(),
            None => {
                let key = parameters
                    .get("input_key")
                    .and_then(Value::as_str)
                    .unwrap_or("message");
                state
                    .get_str(key)
                    .ok_or_else(|| Error::Tool(format!("no prompt in state key {key:?}")))?
                    .to_string()
            }
        };
        let output_key = parameters
            .get("output_key")
            .and_then(Value::as_str)
            .unwrap_or("text");

        let request = CompletionRequest {
            client_id: state.get_str("client_id").unwrap_or_default().to_string(),
            conversation_id: None,
            message: prompt,
            metadata: state.get("metadata").cloned().unwrap_or(Value::Null),
        };
        let mut fragments = self.provider.stream(request).await?;
        let mut text = String::new();
        while let Some(fragment) = fragments.next().await {
            text.push_str(&fragment?);
        }

        let mut out = Outputs::new();
        out.insert(output_key.to_string(), Value::String(text));
        Ok(out)
    }
}
