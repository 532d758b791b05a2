//! Completion provider boundary and a rig-core backed implementation.
//!
//! Workers treat completion as an opaque stream of text fragments; they
//! republish each fragment as a result chunk and never look inside.
//!
//! # Example
//! ```no_run
//! use relay_rs::llm::{RigCompletion, anthropic_client};
//! use secrecy::SecretString;
//!
//! let key = SecretString::from("sk-ant-...");
//! let client = anthropic_client(&key).expect("failed to create Anthropic client");
//! let provider = RigCompletion::new(client, "claude-sonnet-4-20250514");
//! ```

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use rig::agent::{MultiTurnStreamItem, StreamingResult, Text};
use rig::client::CompletionClient;
use rig::streaming::{StreamedAssistantContent, StreamingPrompt};
use secrecy::{ExposeSecret, SecretString};
use tracing::{Instrument, Span};

use crate::error::{Error, Result};
use crate::telemetry::genai::{record_fragments, start_chat_span};

/// What a worker asks the provider for.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub client_id: String,
    pub conversation_id: Option<String>,
    pub message: String,
    pub metadata: serde_json::Value,
}

/// Text fragments in the order they should reach the client.
pub type FragmentStream = BoxStream<'static, Result<String>>;

#[async_trait]
pub trait CompletionProvider: Send + Sync {
    async fn stream(&self, request: CompletionRequest) -> Result<FragmentStream>;
}

/// Create an Anthropic client from a secret API key.
///
/// # Errors
/// Returns an error if the underlying HTTP client cannot be constructed.
pub fn anthropic_client(
    api_key: &SecretString,
) -> std::result::Result<rig::providers::anthropic::Client, rig::http_client::Error> {
    rig::providers::anthropic::Client::new(api_key.expose_secret())
}

/// Completion via a streaming rig Anthropic agent. Each text delta the
/// model emits becomes one fragment.
pub struct RigCompletion {
    client: rig::providers::anthropic::Client,
    model: String,
    preamble: Option<String>,
    max_tokens: u64,
}

impl RigCompletion {
    pub fn new(client: rig::providers::anthropic::Client, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
            preamble: None,
            max_tokens: 1024,
        }
    }

    pub fn preamble(mut self, preamble: impl Into<String>) -> Self {
        self.preamble = Some(preamble.into());
        self
    }

    pub fn max_tokens(mut self, max_tokens: u64) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

#[async_trait]
impl CompletionProvider for RigCompletion {
    async fn stream(&self, request: CompletionRequest) -> Result<FragmentStream> {
        let span = start_chat_span(&self.model, "anthropic");

        let mut builder = self
            .client
            .agent(self.model.as_str())
            .max_tokens(self.max_tokens);
        if let Some(preamble) = &self.preamble {
            builder = builder.preamble(preamble);
        }
        let agent = builder.build();

        let stream = async { agent.stream_prompt(request.message.as_str()).await }
            .instrument(span.clone())
            .await;

        Ok(text_fragments(stream, span))
    }
}

/// Adapts a rig agent stream into fragments. Text deltas pass through in
/// order; tool, reasoning and final items are dropped. The fragment count
/// is recorded on `span` once the stream ends or fails.
pub fn text_fragments<R>(stream: StreamingResult<R>, span: Span) -> FragmentStream
where
    R: Send + 'static,
{
    futures::stream::unfold(
        Some((stream, span, 0u64)),
        |state| async move {
            let (mut stream, span, count) = state?;
            loop {
                match stream.next().await {
                    Some(Ok(MultiTurnStreamItem::StreamAssistantItem(
                        StreamedAssistantContent::Text(Text { text }),
                    ))) => {
                        if text.is_empty() {
                            continue;
                        }
                        return Some((Ok(text), Some((stream, span, count + 1))));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        record_fragments(&span, count);
                        return Some((Err(Error::Completion(e.to_string())), None));
                    }
                    None => {
                        record_fragments(&span, count);
                        return None;
                    }
                }
            }
        },
    )
    .boxed()
}
