//! Anthropic `/messages` dialect (§4.5): `x-api-key` + `anthropic-version`
//! headers, `event:`/`data:` SSE lines. `content_block_delta` carries
//! `delta.text`; `message_stop` ends the stream. The `system` input-role is
//! rewritten to `user` before send and stays in the `messages` array
//! (Anthropic has no `system` message role).

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use reqwest_eventsource::{Event, EventSource};
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::ReceiverStream;
use url::Url;

use super::{build_clients, open_event_source, validate_endpoint};
use crate::error::{truncate_body, LlmError};
use crate::metrics::LlmMetricsSink;
use crate::provider::{ChunkStream, Provider};
use crate::stream_guard::spawn_guarded;
use crate::types::{LlmChunk, LlmMessage, LlmResponse, LlmRole, ProviderType};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const MAX_TOKENS: u32 = 4096;

pub struct AnthropicProvider {
    model: String,
    endpoint: Url,
    api_key: String,
    send_client: Client,
    stream_client: Client,
    metrics: Arc<dyn LlmMetricsSink>,
}

impl AnthropicProvider {
    pub fn new(
        endpoint: &str,
        api_key: impl Into<String>,
        model: impl Into<String>,
        metrics: Arc<dyn LlmMetricsSink>,
    ) -> Result<Self, LlmError> {
        let endpoint = validate_endpoint(endpoint)?;
        let (send_client, stream_client) = build_clients()?;
        Ok(Self { model: model.into(), endpoint, api_key: api_key.into(), send_client, stream_client, metrics })
    }

    #[cfg(test)]
    fn new_unchecked(endpoint: &str, api_key: impl Into<String>, model: impl Into<String>, metrics: Arc<dyn LlmMetricsSink>) -> Self {
        let endpoint = Url::parse(endpoint).expect("test endpoint must parse");
        let (send_client, stream_client) = build_clients().expect("building test http clients");
        Self { model: model.into(), endpoint, api_key: api_key.into(), send_client, stream_client, metrics }
    }

    fn url(&self) -> String {
        format!("{}messages", self.endpoint)
    }

    /// `system` input-role is rewritten to `user` before send (§4.5):
    /// Anthropic has no `system` message role, so it stays in `messages`.
    fn to_wire(&self, history: &[LlmMessage], stream: bool) -> WireRequest {
        let messages = history
            .iter()
            .map(|msg| {
                let role = match msg.role {
                    LlmRole::System | LlmRole::User => "user",
                    LlmRole::Assistant => "assistant",
                };
                WireMessage { role, content: msg.content.clone() }
            })
            .collect();
        WireRequest { model: self.model.clone(), max_tokens: MAX_TOKENS, messages, stream }
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn provider_type(&self) -> ProviderType {
        ProviderType::Anthropic
    }

    async fn send(&self, history: &[LlmMessage]) -> Result<LlmResponse, LlmError> {
        let started = Instant::now();
        let response = self
            .send_client
            .post(self.url())
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&self.to_wire(history, false))
            .send()
            .await
            .map_err(|e| LlmError::Request(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Upstream { status, body: truncate_body(&body) });
        }

        let parsed: WireResponse = response.json().await.map_err(|e| LlmError::Request(e.to_string()))?;
        let content = parsed.content.into_iter().map(|b| b.text).collect::<Vec<_>>().join("");

        Ok(LlmResponse {
            content,
            tokens_used: parsed.usage.input_tokens + parsed.usage.output_tokens,
            duration: started.elapsed(),
        })
    }

    async fn stream(&self, history: &[LlmMessage]) -> Result<ChunkStream, LlmError> {
        let request_builder = self
            .stream_client
            .post(self.url())
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&self.to_wire(history, true));

        let event_source = EventSource::new(request_builder)
            .map_err(|e| LlmError::Config(format!("building event source: {e}")))?;
        let event_source = open_event_source(event_source).await?;

        let metrics = self.metrics.clone();
        let rx = spawn_guarded("anthropic", metrics, move |tx| {
            Box::new(async move { run_producer(event_source, tx).await })
        });
        Ok(ReceiverStream::new(rx).boxed())
    }
}

async fn run_producer(mut event_source: EventSource, tx: crate::stream_guard::ChunkSender) {
    while let Some(event) = event_source.next().await {
        match event {
            Ok(Event::Open) => continue,
            Ok(Event::Message(message)) => {
                let event_name = message.event.as_str();
                match event_name {
                    "content_block_delta" => {
                        match serde_json::from_str::<WireDeltaEvent>(&message.data) {
                            Ok(evt) => {
                                if !evt.delta.text.is_empty()
                                    && tx.send(Ok(LlmChunk::delta(evt.delta.text))).await.is_err()
                                {
                                    return;
                                }
                            }
                            Err(_) => continue,
                        }
                    }
                    "message_stop" => {
                        let _ = tx.send(Ok(LlmChunk::done())).await;
                        break;
                    }
                    // unknown/irrelevant event kinds (ping, message_start, ...) are skipped (§8).
                    _ => continue,
                }
            }
            Err(e) => {
                let _ = tx.send(Err(LlmError::Stream(e.to_string()))).await;
                let _ = tx.send(Ok(LlmChunk::done())).await;
                break;
            }
        }
    }
    event_source.close();
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Serialize)]
struct WireRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<WireMessage>,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct WireContentBlock {
    text: String,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    input_tokens: u32,
    output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    content: Vec<WireContentBlock>,
    usage: WireUsage,
}

#[derive(Debug, Deserialize)]
struct WireDeltaEvent {
    delta: WireTextDelta,
}

#[derive(Debug, Default, Deserialize)]
struct WireTextDelta {
    #[serde(default)]
    text: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::NoopMetricsSink;

    #[test]
    fn system_role_is_rewritten_to_user() {
        let provider = AnthropicProvider::new_unchecked("https://api.anthropic.com/v1/", "key", "claude-test", Arc::new(NoopMetricsSink));
        let history = [
            LlmMessage::new(LlmRole::System, "be terse"),
            LlmMessage::new(LlmRole::User, "hi"),
        ];
        let wire = provider.to_wire(&history, false);
        assert_eq!(wire.messages.len(), 2);
        assert_eq!(wire.messages[0].role, "user");
        assert_eq!(wire.messages[0].content, "be terse");
        assert_eq!(wire.messages[1].role, "user");
        assert_eq!(wire.messages[1].content, "hi");
    }

    #[tokio::test]
    async fn send_concatenates_content_blocks() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/v1/messages")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"content":[{"text":"Hel"},{"text":"lo"}],"usage":{"input_tokens":3,"output_tokens":2}}"#)
            .create_async()
            .await;

        let provider = AnthropicProvider::new_unchecked(&format!("{}/v1/", server.url()), "key", "claude-test", Arc::new(NoopMetricsSink));
        let history = [LlmMessage::new(LlmRole::User, "hi")];
        let response = provider.send(&history).await.unwrap();
        assert_eq!(response.content, "Hello");
        assert_eq!(response.tokens_used, 5);
    }
}
