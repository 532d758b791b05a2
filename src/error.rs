//! Error types for relay-rs.

use thiserror::Error;

use crate::model::JobStatus;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid job state transition: {from} -> {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    /// Queue depth is above the hard ceiling; the job was not enqueued.
    #[error("queue overloaded: depth {depth} exceeds ceiling {ceiling}")]
    Overloaded { depth: u64, ceiling: u64 },

    #[error("invalid plan: {0}")]
    InvalidPlan(String),

    /// No step is runnable but the plan is not complete: a cycle, or a
    /// dependency on a step that does not exist.
    #[error("plan {plan_id} cannot make progress; unresolved steps: {pending:?}")]
    UnresolvableDependencies {
        plan_id: String,
        pending: Vec<String>,
    },

    #[error("step {step_id} failed: {message}")]
    StepFailed { step_id: String, message: String },

    #[error("tool error: {0}")]
    Tool(String),

    #[error("completion error: {0}")]
    Completion(String),

    #[error("delivery failed: {0}")]
    Delivery(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Stable code surfaced to clients in structured failure messages.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Overloaded { .. } => "OVERLOADED",
            Error::UnresolvableDependencies { .. } => "PLAN_CYCLE_OR_MISSING_DEPENDENCY",
            Error::StepFailed { .. } => "STEP_EXECUTION_FAILURE",
            Error::InvalidPlan(_) => "INVALID_PLAN",
            Error::Delivery(_) => "DELIVERY_FAILURE",
            Error::InvalidTransition { .. } => "INVALID_TRANSITION",
            Error::Tool(_) | Error::Completion(_) => "TRANSIENT_WORKER_FAILURE",
            Error::Config(_) => "CONFIG",
            Error::Storage(_) | Error::Json(_) | Error::Io(_) | Error::Other(_) => "INTERNAL",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
