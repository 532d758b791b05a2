//! Workflow plan span helpers.

use tracing::Span;

/// Start a span for one plan instance.
pub fn start_plan_span(plan_id: &str, steps: usize) -> Span {
    tracing::info_span!(
        "plan.execute",
        "plan.id" = plan_id,
        "plan.steps" = steps,
        "plan.rounds" = tracing::field::Empty,
        "plan.status" = tracing::field::Empty,
    )
}

/// Start a span for one step invocation within a round.
pub fn start_step_span(step_id: &str, action: &str, round: usize) -> Span {
    tracing::info_span!(
        "plan.step",
        "step.id" = step_id,
        "step.action" = action,
        "step.round" = round,
    )
}

/// Record the terminal status and round count of a plan.
pub fn record_plan_outcome(span: &Span, status: &str, rounds: usize) {
    span.record("plan.status", status);
    span.record("plan.rounds", rounds);
}
