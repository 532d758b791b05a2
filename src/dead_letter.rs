//! Dead-letter log for jobs that exhausted their retries.

use chrono::Utc;
use opentelemetry::KeyValue;
use std::sync::Arc;
use tracing::warn;

use crate::error::Result;
use crate::log::{DurableLog, Position};
use crate::model::{DeadLetter, Job, JobStatus};
use crate::telemetry::metrics;

#[derive(Clone)]
pub struct DeadLetterQueue {
    log: Arc<dyn DurableLog>,
}

impl DeadLetterQueue {
    pub fn new(log: Arc<dyn DurableLog>) -> Self {
        Self { log }
    }

    /// Record a dead job with its failure context, then remove its delivery
    /// from the active queue so it can't be reclaimed.
    ///
    /// The dead-letter append happens first: if removal fails the job may
    /// briefly exist in both logs, but never in neither.
    pub async fn dead_letter(
        &self,
        job: &Job,
        error: &str,
        queue: &dyn DurableLog,
        group: &str,
        position: Position,
    ) -> Result<Position> {
        let mut job = job.clone();
        job.status = JobStatus::Dead;
        let dl_position = self.record(serde_json::to_value(&job)?, error).await?;

        queue.ack(group, position).await?;
        queue.delete(position).await?;

        warn!(
            job_id = %job.id,
            job_type = %job.job_type,
            retry_count = job.retry_count,
            %error,
            "job dead-lettered"
        );
        metrics::jobs_dead_lettered().add(1, &[KeyValue::new("job_type", job.job_type.clone())]);
        Ok(dl_position)
    }

    /// Dead-letter a raw queue entry that couldn't be decoded as a job.
    pub async fn dead_letter_raw(
        &self,
        payload: serde_json::Value,
        error: &str,
        queue: &dyn DurableLog,
        group: &str,
        position: Position,
    ) -> Result<Position> {
        let dl_position = self.record(payload, error).await?;
        queue.ack(group, position).await?;
        queue.delete(position).await?;
        warn!(%position, %error, "malformed queue entry dead-lettered");
        metrics::jobs_dead_lettered().add(1, &[KeyValue::new("job_type", "unknown")]);
        Ok(dl_position)
    }

    async fn record(&self, job: serde_json::Value, error: &str) -> Result<Position> {
        let letter = DeadLetter {
            job,
            error: error.to_string(),
            failed_at: Utc::now(),
        };
        self.log.append(&serde_json::to_value(&letter)?).await
    }

    /// Up to `limit` dead letters, oldest first.
    pub async fn list(&self, limit: usize) -> Result<Vec<(Position, DeadLetter)>> {
        let entries = self
            .log
            .read_after(Position::ZERO, limit, std::time::Duration::ZERO)
            .await?;
        entries
            .into_iter()
            .map(|e| Ok((e.position, serde_json::from_value(e.payload)?)))
            .collect()
    }

    /// Number of dead letters retained.
    pub async fn len(&self) -> Result<u64> {
        self.log.len().await
    }
}
