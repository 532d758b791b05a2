//! Retry bookkeeping as pure state transitions.
//!
//! A failed job is not mutated in place in the queue. Instead the worker
//! acknowledges the failed delivery and appends the entry produced by
//! [`requeue`]; exhausted jobs go to the dead-letter log. Keeping the
//! transition free of I/O makes it testable without a log.

use chrono::Utc;
use std::time::Duration;

use crate::model::{Job, JobStatus};

/// How many attempts a job gets and how long to wait between them.
///
/// The delay is fixed rather than exponential.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// A job is dead-lettered when its `retry_count` reaches this value.
    pub max_retries: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            delay: Duration::from_secs(1),
        }
    }
}

/// What happens to a job after a failed or abandoned attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Requeue {
    /// Try again with this job.
    Retry(Job),
    /// Budget spent; this job belongs in the dead-letter log.
    Exhausted(Job),
}

impl Requeue {
    pub fn job(&self) -> &Job {
        match self {
            Requeue::Retry(job) | Requeue::Exhausted(job) => job,
        }
    }
}

/// Bookkeeping for a failed attempt: bump `retry_count`, record the error,
/// and produce either a fresh pending entry or an exhausted job.
pub fn requeue(job: &Job, error: &str, policy: &RetryPolicy) -> Requeue {
    let mut next = job.clone();
    next.retry_count = job.retry_count.saturating_add(1);
    next.last_error = Some(error.to_string());
    next.claimed_by = None;

    if next.retry_count >= policy.max_retries {
        next.status = JobStatus::Dead;
        Requeue::Exhausted(next)
    } else {
        next.status = JobStatus::Pending;
        next.enqueued_at = Utc::now();
        Requeue::Retry(next)
    }
}

/// Bookkeeping for a delivery reclaimed from an idle consumer. The lost
/// attempt counts against the budget; a surviving job stays claimed by
/// `consumer` and is processed in place.
pub fn reclaim(
    job: &Job,
    previous_owner: &str,
    consumer: &str,
    policy: &RetryPolicy,
) -> Requeue {
    let error = format!("abandoned by {previous_owner}");
    match requeue(job, &error, policy) {
        Requeue::Retry(mut next) => {
            next.status = JobStatus::Claimed;
            next.claimed_by = Some(consumer.to_string());
            next.enqueued_at = job.enqueued_at;
            Requeue::Retry(next)
        }
        exhausted => exhausted,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NewJob;

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            delay: Duration::ZERO,
        }
    }

    #[test]
    fn requeue_increments_until_exhausted() {
        let policy = policy(3);
        let mut job = NewJob::new("chat", "client-a").into_job();
        job.status = JobStatus::Processing;

        let Requeue::Retry(first) = requeue(&job, "boom", &policy) else {
            panic!("first failure should retry");
        };
        assert_eq!(first.retry_count, 1);
        assert_eq!(first.status, JobStatus::Pending);
        assert_eq!(first.id, job.id);
        assert_eq!(first.last_error.as_deref(), Some("boom"));

        let Requeue::Retry(second) = requeue(&first, "boom", &policy) else {
            panic!("second failure should retry");
        };
        assert_eq!(second.retry_count, 2);

        let Requeue::Exhausted(dead) = requeue(&second, "boom", &policy) else {
            panic!("third failure should exhaust");
        };
        assert_eq!(dead.retry_count, 3);
        assert_eq!(dead.status, JobStatus::Dead);
    }

    #[test]
    fn reclaim_keeps_claim_with_new_owner() {
        let mut job = NewJob::new("chat", "client-a").into_job();
        job.status = JobStatus::Claimed;
        job.claimed_by = Some("w1".to_string());

        let Requeue::Retry(next) = reclaim(&job, "w1", "w2", &policy(3)) else {
            panic!("reclaim under budget should retry");
        };
        assert_eq!(next.retry_count, 1);
        assert_eq!(next.status, JobStatus::Claimed);
        assert_eq!(next.claimed_by.as_deref(), Some("w2"));
        assert_eq!(next.enqueued_at, job.enqueued_at);
    }

    #[test]
    fn zero_budget_exhausts_immediately() {
        let job = NewJob::new("chat", "client-a").into_job();
        assert!(matches!(
            requeue(&job, "boom", &policy(0)),
            Requeue::Exhausted(_)
        ));
    }
}
