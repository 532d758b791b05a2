//! Consumer-group worker: pulls jobs from the queue, routes them to
//! handlers, and acknowledges, retries or dead-letters each delivery.

pub mod pool;
pub mod registry;

pub use pool::WorkerPool;
pub use registry::{HandlerRegistry, JobHandler};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, error, info, warn};

use crate::dead_letter::DeadLetterQueue;
use crate::error::Result;
use crate::log::{Delivery, DurableLog, Position};
use crate::model::{Job, JobStatus};
use crate::results::ResultPublisher;
use crate::retry::{Requeue, RetryPolicy, reclaim, requeue};
use crate::telemetry::job::{record_state_transition, start_job_span};

/// Final chunk sent to a client whose job was dead-lettered.
pub const FAILURE_MESSAGE: &str = "Sorry, your request could not be completed.";

/// Entries reclaimed per `claim_idle` call while recovering.
const RECLAIM_BATCH: usize = 100;

/// Pause after a failed queue read before trying again.
const READ_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Worker tuning.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Consumer group shared by all workers on the queue.
    pub group: String,
    /// How long a read waits for new entries.
    pub block: Duration,
    /// Entries per read.
    pub batch_size: usize,
    /// Deliveries pending longer than this are reclaimed.
    pub claim_idle_after: Duration,
    pub retry: RetryPolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            group: "workers".to_string(),
            block: Duration::from_secs(5),
            batch_size: 1,
            claim_idle_after: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }
}

/// What happened to one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Acked,
    Requeued,
    DeadLettered,
}

/// A single consumer in the worker group.
///
/// Workers process their deliveries one at a time. Many workers, in this
/// process or others, may share a group; the log guarantees each entry is
/// owned by one of them at a time.
#[derive(Clone)]
pub struct Worker {
    id: String,
    jobs: Arc<dyn DurableLog>,
    results: ResultPublisher,
    dead_letters: DeadLetterQueue,
    handlers: Arc<HandlerRegistry>,
    config: WorkerConfig,
    shutdown: CancellationToken,
}

impl Worker {
    pub fn new(
        id: impl Into<String>,
        jobs: Arc<dyn DurableLog>,
        results: ResultPublisher,
        dead_letters: DeadLetterQueue,
        handlers: Arc<HandlerRegistry>,
    ) -> Self {
        Self {
            id: id.into(),
            jobs,
            results,
            dead_letters,
            handlers,
            config: WorkerConfig::default(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    /// Stop when `token` is cancelled instead of a private token.
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Consumer name within the group.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Ask the loop to stop after the current delivery.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Run until shutdown.
    ///
    /// Recovers abandoned deliveries once, then reads the group in a loop.
    /// Recovery runs only at startup: a live peer never refreshes its
    /// pending entries, so reclaiming later would steal jobs still in
    /// progress. Errors from single deliveries are logged and never stop
    /// the loop.
    pub async fn run(&self) -> Result<()> {
        info!(worker = %self.id, group = %self.config.group, "worker started");

        self.recover_logged().await;

        loop {
            let read = tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!(worker = %self.id, "worker shutting down");
                    return Ok(());
                }
                read = self.read_batch() => read,
            };

            // Claimed deliveries run to completion even if shutdown arrives.
            match read {
                Ok(deliveries) => self.process_all(deliveries).await,
                Err(e) => {
                    error!(worker = %self.id, error = %e, "queue read failed");
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(READ_ERROR_BACKOFF) => {}
                    }
                }
            }
        }
    }

    /// Read one batch (waiting up to `block`) and process it. Returns the
    /// number of deliveries handled.
    pub async fn poll_once(&self) -> Result<usize> {
        let deliveries = self.read_batch().await?;
        let n = deliveries.len();
        self.process_all(deliveries).await;
        Ok(n)
    }

    async fn read_batch(&self) -> Result<Vec<Delivery>> {
        self.jobs
            .read_group(
                &self.config.group,
                &self.id,
                self.config.batch_size,
                self.config.block,
            )
            .await
    }

    async fn process_all(&self, deliveries: Vec<Delivery>) {
        for delivery in deliveries {
            let position = delivery.entry.position;
            if let Err(e) = self.process(delivery, None).await {
                error!(worker = %self.id, %position, error = %e, "delivery processing failed");
            }
        }
    }

    /// Take over deliveries other consumers left idle past
    /// `claim_idle_after` and process them. Every takeover counts as an
    /// attempt. Returns the number reclaimed.
    pub async fn recover(&self) -> Result<usize> {
        let group = self.config.group.as_str();
        let owners: HashMap<Position, String> = self
            .jobs
            .pending(group)
            .await?
            .into_iter()
            .map(|p| (p.position, p.consumer))
            .collect();

        let mut total = 0;
        loop {
            let reclaimed = self
                .jobs
                .claim_idle(group, &self.id, self.config.claim_idle_after, RECLAIM_BATCH)
                .await?;
            if reclaimed.is_empty() {
                break;
            }
            total += reclaimed.len();
            for delivery in reclaimed {
                let position = delivery.entry.position;
                let owner = owners
                    .get(&position)
                    .map(String::as_str)
                    .unwrap_or("unknown consumer");
                info!(
                    worker = %self.id,
                    %position,
                    previous_owner = owner,
                    "reclaimed idle delivery"
                );
                if let Err(e) = self.process(delivery, Some(owner)).await {
                    error!(worker = %self.id, %position, error = %e, "reclaimed delivery failed");
                }
            }
        }
        Ok(total)
    }

    async fn recover_logged(&self) {
        match self.recover().await {
            Ok(0) => {}
            Ok(n) => info!(worker = %self.id, reclaimed = n, "recovered idle deliveries"),
            Err(e) => error!(worker = %self.id, error = %e, "recovery failed"),
        }
    }

    /// Drive one delivery to a terminal state.
    ///
    /// `previous_owner` is set when the delivery was reclaimed.
    pub async fn process(
        &self,
        delivery: Delivery,
        previous_owner: Option<&str>,
    ) -> Result<Outcome> {
        let position = delivery.entry.position;
        let job: Job = match serde_json::from_value(delivery.entry.payload.clone()) {
            Ok(job) => job,
            Err(e) => {
                self.dead_letters
                    .dead_letter_raw(
                        delivery.entry.payload,
                        &format!("malformed job entry: {e}"),
                        self.jobs.as_ref(),
                        &self.config.group,
                        position,
                    )
                    .await?;
                return Ok(Outcome::DeadLettered);
            }
        };

        let span = start_job_span(&job.job_type, &job.id, &self.id, job.retry_count);
        self.process_job(job, position, previous_owner, &span)
            .instrument(span.clone())
            .await
    }

    async fn process_job(
        &self,
        mut job: Job,
        position: Position,
        previous_owner: Option<&str>,
        span: &Span,
    ) -> Result<Outcome> {
        match previous_owner {
            None => {
                advance(&mut job, JobStatus::Claimed, span)?;
                job.claimed_by = Some(self.id.clone());
            }
            Some(owner) => {
                // The stored copy predates the lost claim.
                job.status = JobStatus::Claimed;
                match reclaim(&job, owner, &self.id, &self.config.retry) {
                    Requeue::Retry(next) => {
                        job = next;
                        record_state_transition(span, JobStatus::Claimed, JobStatus::Claimed);
                    }
                    Requeue::Exhausted(dead) => {
                        let error = dead.last_error.clone().unwrap_or_default();
                        record_state_transition(span, JobStatus::Claimed, JobStatus::Dead);
                        self.bury(&dead, &error, position).await?;
                        return Ok(Outcome::DeadLettered);
                    }
                }
            }
        }

        let Some(handler) = self.handlers.handler_for(&job.job_type) else {
            let error = format!("no handler registered for job type {:?}", job.job_type);
            advance(&mut job, JobStatus::Dead, span)?;
            self.bury(&job, &error, position).await?;
            return Ok(Outcome::DeadLettered);
        };

        advance(&mut job, JobStatus::Processing, span)?;
        let sink = self.results.sink(job.id, job.client_id.clone());
        let result = handler.handle(&job, &sink).await;

        match result {
            Ok(()) => {
                if !sink.is_finished() {
                    sink.finish("").await?;
                }
                self.jobs.ack(&self.config.group, position).await?;
                self.jobs.delete(position).await?;
                advance(&mut job, JobStatus::Acked, span)?;
                info!(job_id = %job.id, chunks = sink.sent(), "job acked");
                Ok(Outcome::Acked)
            }
            Err(e) => {
                let error = e.to_string();
                match requeue(&job, &error, &self.config.retry) {
                    Requeue::Retry(next) => {
                        warn!(
                            job_id = %job.id,
                            retry_count = next.retry_count,
                            %error,
                            "job failed, requeueing"
                        );
                        tokio::time::sleep(self.config.retry.delay).await;
                        // Append before ack: a crash in between duplicates
                        // the job rather than losing it.
                        self.jobs.append(&serde_json::to_value(&next)?).await?;
                        self.jobs.ack(&self.config.group, position).await?;
                        self.jobs.delete(position).await?;
                        advance(&mut job, JobStatus::Requeued, span)?;
                        Ok(Outcome::Requeued)
                    }
                    Requeue::Exhausted(dead) => {
                        advance(&mut job, JobStatus::Dead, span)?;
                        self.bury(&dead, &error, position).await?;
                        Ok(Outcome::DeadLettered)
                    }
                }
            }
        }
    }

    /// Move a job to the dead-letter log and tell its client.
    async fn bury(&self, job: &Job, error: &str, position: Position) -> Result<()> {
        self.dead_letters
            .dead_letter(job, error, self.jobs.as_ref(), &self.config.group, position)
            .await?;
        if let Err(e) = self
            .results
            .publish_chunk(job.id, &job.client_id, FAILURE_MESSAGE, true)
            .await
        {
            warn!(job_id = %job.id, error = %e, "failed to publish failure chunk");
        }
        Ok(())
    }
}

fn advance(job: &mut Job, to: JobStatus, span: &Span) -> Result<()> {
    let from = job.status;
    job.transition(to)?;
    record_state_transition(span, from, to);
    Ok(())
}
