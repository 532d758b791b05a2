//! Jobs and their lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// A unit of work travelling through the job queue.
///
/// The serialized job is the queue entry payload. A retried job is a fresh
/// entry carrying the same `id` and a higher `retry_count`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique identifier, stable across retries.
    pub id: JobId,

    /// What kind of job this is (e.g. "chat", "plan").
    /// Determines which handler processes it.
    #[serde(rename = "type")]
    pub job_type: String,

    /// The client results are addressed to.
    pub client_id: String,

    /// Conversation the request belongs to, if any.
    pub conversation_id: Option<String>,

    /// Handler-specific data. The queue doesn't interpret this.
    pub payload: serde_json::Value,

    /// Current lifecycle state.
    pub status: JobStatus,

    /// Failed or abandoned attempts so far. Never decreases.
    pub retry_count: u32,

    pub enqueued_at: DateTime<Utc>,

    /// Worker currently holding the claim.
    pub claimed_by: Option<String>,

    /// Error from the most recent failed attempt.
    pub last_error: Option<String>,
}

impl Job {
    /// Move to `to`, rejecting transitions the lifecycle doesn't allow.
    pub fn transition(&mut self, to: JobStatus) -> crate::error::Result<()> {
        if !self.status.can_transition_to(to) {
            return Err(crate::error::Error::InvalidTransition {
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }

    /// Convenience accessor for the user message carried in the payload.
    pub fn message(&self) -> Option<&str> {
        self.payload.get("message").and_then(|v| v.as_str())
    }
}

/// Newtype for job IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// In the queue, not yet delivered.
    Pending,
    /// Delivered to a worker under the consumer group.
    Claimed,
    /// Handler running.
    Processing,
    /// Done; entry acknowledged and removed. Terminal.
    Acked,
    /// Failed; a fresh copy was appended for another attempt. Terminal for
    /// this entry.
    Requeued,
    /// Moved to the dead-letter log. Terminal.
    Dead,
}

impl JobStatus {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, to),
            (Pending, Claimed)
                | (Requeued, Claimed)   // the re-appended copy
                | (Claimed, Claimed)    // reclaimed from an idle consumer
                | (Claimed, Processing)
                | (Claimed, Dead)       // unroutable, or exhausted on reclaim
                | (Processing, Acked)
                | (Processing, Requeued)
                | (Processing, Dead)
        )
    }

    /// Is this a terminal state for a queue entry?
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Acked | JobStatus::Requeued | JobStatus::Dead)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Claimed => "claimed",
            JobStatus::Processing => "processing",
            JobStatus::Acked => "acked",
            JobStatus::Requeued => "requeued",
            JobStatus::Dead => "dead",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Dead letter
// ---------------------------------------------------------------------------

/// A job that exhausted its retry budget, with failure context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    /// The full job payload as it was when it died. Kept as raw JSON so
    /// undecodable queue entries can be dead-lettered too.
    pub job: serde_json::Value,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetter {
    /// Decode the dead job, if it was a well-formed one.
    pub fn decode_job(&self) -> Option<Job> {
        serde_json::from_value(self.job.clone()).ok()
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for new jobs. The producer's public API for submitting work.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub(crate) job_type: String,
    pub(crate) client_id: String,
    pub(crate) conversation_id: Option<String>,
    pub(crate) message: Option<String>,
    pub(crate) metadata: serde_json::Value,
    pub(crate) payload: serde_json::Map<String, serde_json::Value>,
}

impl NewJob {
    pub fn new(job_type: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            job_type: job_type.into(),
            client_id: client_id.into(),
            conversation_id: None,
            message: None,
            metadata: serde_json::Value::Null,
            payload: serde_json::Map::new(),
        }
    }

    pub fn conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Attach an extra payload field for the handler (e.g. `"plan"`).
    pub fn field(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.payload.insert(key.into(), value);
        self
    }

    /// Materialize the job as it will be appended to the queue.
    pub fn into_job(self) -> Job {
        let mut payload = self.payload;
        if let Some(message) = self.message {
            payload.insert("message".to_string(), serde_json::Value::String(message));
        }
        if !self.metadata.is_null() {
            payload.insert("metadata".to_string(), self.metadata);
        }

        Job {
            id: JobId::new(),
            job_type: self.job_type,
            client_id: self.client_id,
            conversation_id: self.conversation_id,
            payload: serde_json::Value::Object(payload),
            status: JobStatus::Pending,
            retry_count: 0,
            enqueued_at: Utc::now(),
            claimed_by: None,
            last_error: None,
        }
    }
}
