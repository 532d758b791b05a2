//! GenAI semantic convention span helpers for completion calls.
//!
//! Uses OpenTelemetry GenAI semantic conventions:
//! - `gen_ai.operation.name`
//! - `gen_ai.request.model`
//! - `gen_ai.provider.name`
//! - `gen_ai.response.fragments`

use tracing::Span;

/// Start a span for a streamed chat completion.
///
/// The fragment count is declared empty and filled in by
/// [`record_fragments`] once the stream ends.
pub fn start_chat_span(model: &str, provider: &str) -> Span {
    tracing::info_span!(
        "gen_ai.chat",
        "gen_ai.operation.name" = "chat",
        "gen_ai.request.model" = model,
        "gen_ai.provider.name" = provider,
        "gen_ai.response.fragments" = tracing::field::Empty,
    )
}

/// Record how many text fragments a completion produced.
pub fn record_fragments(span: &Span, fragments: u64) {
    span.record("gen_ai.response.fragments", fragments);
}
