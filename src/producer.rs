//! Backpressure-aware job submission.
//!
//! The depth check and the append are separate operations, so concurrent
//! producers can both pass the check and push the queue past a ceiling
//! for a moment. Admission is approximate by design of the log API.

use opentelemetry::KeyValue;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::handlers::CHAT_JOB;
use crate::log::DurableLog;
use crate::model::{JobId, NewJob};
use crate::telemetry::metrics;

/// Queue-depth thresholds.
#[derive(Debug, Clone)]
pub struct BackpressureConfig {
    /// Above this depth, submissions are delayed by `shed_delay`.
    pub soft_ceiling: u64,
    /// Above this depth, submissions are rejected.
    pub hard_ceiling: u64,
    pub shed_delay: Duration,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            soft_ceiling: 3000,
            hard_ceiling: 5000,
            shed_delay: Duration::from_secs(1),
        }
    }
}

/// Appends jobs to the queue after checking its depth.
#[derive(Clone)]
pub struct Producer {
    jobs: Arc<dyn DurableLog>,
    config: BackpressureConfig,
}

impl Producer {
    pub fn new(jobs: Arc<dyn DurableLog>, config: BackpressureConfig) -> Self {
        Self { jobs, config }
    }

    /// Submit a job. Fails with [`Error::Overloaded`] without enqueueing
    /// when the queue is above the hard ceiling; sleeps `shed_delay` first
    /// when it is above the soft ceiling.
    pub async fn submit(&self, new: NewJob) -> Result<JobId> {
        let job_type = new.job_type.clone();
        let depth = self.jobs.len().await?;

        if depth > self.config.hard_ceiling {
            warn!(
                depth,
                ceiling = self.config.hard_ceiling,
                %job_type,
                "queue overloaded, rejecting"
            );
            metrics::jobs_submitted().add(
                1,
                &[
                    KeyValue::new("job_type", job_type),
                    KeyValue::new("result", "overloaded"),
                ],
            );
            return Err(Error::Overloaded {
                depth,
                ceiling: self.config.hard_ceiling,
            });
        }

        let delayed = depth > self.config.soft_ceiling;
        if delayed {
            debug!(
                depth,
                delay = ?self.config.shed_delay,
                "queue above soft ceiling, shedding load"
            );
            tokio::time::sleep(self.config.shed_delay).await;
        }

        let job = new.into_job();
        let id = job.id;
        let position = self.jobs.append(&serde_json::to_value(&job)?).await?;
        debug!(job_id = %id, %position, %job_type, "job enqueued");

        metrics::jobs_submitted().add(
            1,
            &[
                KeyValue::new("job_type", job_type),
                KeyValue::new("result", if delayed { "delayed" } else { "ok" }),
            ],
        );
        Ok(id)
    }

    /// Submit a chat message on behalf of an already-authenticated user.
    pub async fn submit_message(
        &self,
        user_id: &str,
        conversation_id: Option<&str>,
        message: &str,
        metadata: serde_json::Value,
    ) -> Result<JobId> {
        let mut new = NewJob::new(CHAT_JOB, user_id)
            .message(message)
            .metadata(metadata);
        if let Some(conversation_id) = conversation_id {
            new = new.conversation(conversation_id);
        }
        self.submit(new).await
    }

    /// Current queue depth.
    pub async fn depth(&self) -> Result<u64> {
        self.jobs.len().await
    }
}
