//! Job execution span helpers.

use tracing::Span;

use crate::model::{JobId, JobStatus};

/// Start a span covering one delivery of a job to a worker.
///
/// `job.status` is declared empty and updated by
/// [`record_state_transition`].
pub fn start_job_span(
    job_type: &str,
    job_id: &JobId,
    worker_id: &str,
    retry_count: u32,
) -> Span {
    tracing::info_span!(
        "job.process",
        "job.type" = job_type,
        "job.id" = %job_id,
        "job.worker" = worker_id,
        "job.retry_count" = retry_count,
        "job.status" = tracing::field::Empty,
    )
}

/// Record a state transition on the given span and count it.
pub fn record_state_transition(span: &Span, from: JobStatus, to: JobStatus) {
    span.record("job.status", tracing::field::display(to));
    span.in_scope(|| {
        tracing::info!(%from, %to, "state_transition");
    });
    super::metrics::job_state_transitions().add(
        1,
        &[
            opentelemetry::KeyValue::new("from", from.to_string()),
            opentelemetry::KeyValue::new("to", to.to_string()),
        ],
    );
}
