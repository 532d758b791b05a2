//! Metric instrument factories for relay-rs.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"relay-rs"` meter; without
//! a provider they are no-ops.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("relay-rs")
}

/// Counter: job submissions.
/// Labels: `job_type`, `result` ("ok" | "delayed" | "overloaded").
pub fn jobs_submitted() -> Counter<u64> {
    meter()
        .u64_counter("relay.jobs.submitted")
        .with_description("Number of job submissions")
        .build()
}

/// Counter: job state transitions.
/// Labels: `from`, `to`.
pub fn job_state_transitions() -> Counter<u64> {
    meter()
        .u64_counter("relay.jobs.state_transitions")
        .with_description("Number of job state transitions")
        .build()
}

/// Counter: jobs moved to the dead-letter log.
/// Labels: `job_type`.
pub fn jobs_dead_lettered() -> Counter<u64> {
    meter()
        .u64_counter("relay.jobs.dead_lettered")
        .with_description("Jobs that exhausted their retries")
        .build()
}

/// Counter: log operations (append, read_group, ack, claim_idle, ...).
/// Labels: `log`, `operation`.
pub fn log_operations() -> Counter<u64> {
    meter()
        .u64_counter("relay.log.operations")
        .with_description("Number of durable log operations")
        .build()
}

/// Counter: result chunks handled by gateway listeners.
/// Labels: `outcome` ("forwarded" | "send_failed").
pub fn chunks_forwarded() -> Counter<u64> {
    meter()
        .u64_counter("relay.gateway.chunks")
        .with_description("Result chunks handled by gateway listeners")
        .build()
}

/// Counter: orchestrator rounds executed.
/// Labels: `outcome` ("completed" | "failed").
pub fn plan_rounds() -> Counter<u64> {
    meter()
        .u64_counter("relay.plan.rounds")
        .with_description("Orchestrator rounds executed")
        .build()
}

/// Histogram: operation duration in milliseconds.
/// Labels: `operation`.
pub fn operation_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("relay.operation.duration_ms")
        .with_description("Operation duration in milliseconds")
        .with_unit("ms")
        .build()
}
