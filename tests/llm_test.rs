//! Adapting rig agent streams into completion fragments.

use futures::StreamExt;
use relay_rs::llm::text_fragments;
use rig::agent::{FinalResponse, MultiTurnStreamItem, StreamingError, StreamingResult};
use rig::completion::CompletionError;
use rig::streaming::StreamedAssistantContent;

fn text(t: &str) -> Result<MultiTurnStreamItem<()>, StreamingError> {
    Ok(MultiTurnStreamItem::StreamAssistantItem(
        StreamedAssistantContent::text(t),
    ))
}

fn agent_stream(
    items: Vec<Result<MultiTurnStreamItem<()>, StreamingError>>,
) -> StreamingResult<()> {
    Box::pin(futures::stream::iter(items))
}

#[tokio::test]
async fn each_text_delta_is_one_fragment() {
    let stream = agent_stream(vec![
        text("Hel"),
        text(""),
        Ok(MultiTurnStreamItem::StreamAssistantItem(
            StreamedAssistantContent::Final(()),
        )),
        text("lo"),
        text(" there"),
        Ok(MultiTurnStreamItem::FinalResponse(FinalResponse::empty())),
    ]);

    let fragments: Vec<String> = text_fragments(stream, tracing::Span::none())
        .map(|f| f.unwrap())
        .collect()
        .await;

    assert_eq!(fragments, ["Hel", "lo", " there"]);
}

#[tokio::test]
async fn provider_error_ends_the_stream() {
    let stream = agent_stream(vec![
        text("partial"),
        Err(StreamingError::Completion(CompletionError::ProviderError(
            "overloaded".to_string(),
        ))),
        text("never seen"),
    ]);

    let items: Vec<_> = text_fragments(stream, tracing::Span::none()).collect().await;

    assert_eq!(items.len(), 2);
    assert_eq!(items[0].as_ref().unwrap(), "partial");
    let err = items[1].as_ref().unwrap_err();
    assert_eq!(err.code(), "TRANSIENT_WORKER_FAILURE");
    assert!(err.to_string().contains("overloaded"));
}
