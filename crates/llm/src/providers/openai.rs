//! OpenAI `/chat/completions` dialect (§4.5): `data: ` prefixed lines
//! carrying `choices[0].delta.content`, terminated by the literal sentinel
//! `data: [DONE]`.

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
use crate::types::{LlmChunk, LlmMessage, LlmResponse, ProviderType};

pub struct OpenaiProvider {
    model: String,
    endpoint: Url,
    api_key: String,
    send_client: Client,
    stream_client: Client,
    metrics: Arc<dyn LlmMetricsSink>,
}

impl OpenaiProvider {
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

    fn url(&self) -> String {
        format!("{}chat/completions", self.endpoint)
    }

    #[cfg(test)]
    fn new_unchecked(endpoint: &str, api_key: impl Into<String>, model: impl Into<String>, metrics: Arc<dyn LlmMetricsSink>) -> Self {
        let endpoint = Url::parse(endpoint).expect("test endpoint must parse");
        let (send_client, stream_client) = build_clients().expect("building test http clients");
        Self { model: model.into(), endpoint, api_key: api_key.into(), send_client, stream_client, metrics }
    }

    fn to_wire(&self, history: &[LlmMessage], stream: bool) -> WireRequest {
        WireRequest {
            model: self.model.clone(),
            messages: history.iter().map(WireMessage::from).collect(),
            stream,
        }
    }
}

#[async_trait]
impl Provider for OpenaiProvider {
    fn provider_type(&self) -> ProviderType {
        ProviderType::Openai
    }

    async fn send(&self, history: &[LlmMessage]) -> Result<LlmResponse, LlmError> {
        let started = Instant::now();
        let response = self
            .send_client
            .post(self.url())
            .bearer_auth(&self.api_key)
            .json(&self.to_wire(history, false))
            .send()
            .await
            .map_err(|e| LlmError::Request(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Upstream { status, body: truncate_body(&body) });
        }

        let parsed: WireResponse =
            response.json().await.map_err(|e| LlmError::Request(e.to_string()))?;
        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::Stream("provider returned no choices".into()))?;

        Ok(LlmResponse {
            content: choice.message.content,
            tokens_used: parsed.usage.map(|u| u.total_tokens).unwrap_or_default(),
            duration: started.elapsed(),
        })
    }

    async fn stream(&self, history: &[LlmMessage]) -> Result<ChunkStream, LlmError> {
        let request_builder = self
            .stream_client
            .post(self.url())
            .bearer_auth(&self.api_key)
            .json(&self.to_wire(history, true));

        let event_source = EventSource::new(request_builder)
            .map_err(|e| LlmError::Config(format!("building event source: {e}")))?;
        let event_source = open_event_source(event_source).await?;

        let metrics = self.metrics.clone();
        let rx = spawn_guarded("openai", metrics, move |tx| {
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
                if message.data == "[DONE]" {
                    let _ = tx.send(Ok(LlmChunk::done())).await;
                    break;
                }
                match serde_json::from_str::<WireStreamChunk>(&message.data) {
                    Ok(chunk) => {
                        let mut finished = false;
                        for choice in chunk.choices {
                            if let Some(content) = choice.delta.content {
                                if !content.is_empty() && tx.send(Ok(LlmChunk::delta(content))).await.is_err() {
                                    return;
                                }
                            }
                            if choice.finish_reason.is_some() {
                                finished = true;
                            }
                        }
                        if finished && tx.send(Ok(LlmChunk::done())).await.is_err() {
                            return;
                        }
                    }
                    // SSE decoder is idempotent over malformed lines (§8): skip, don't error.
                    Err(_) => continue,
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
struct WireRequest {
    model: String,
    messages: Vec<WireMessage>,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: &'static str,
    content: String,
}

impl From<&LlmMessage> for WireMessage {
    fn from(msg: &LlmMessage) -> Self {
        let role = match msg.role {
            crate::types::LlmRole::System => "system",
            crate::types::LlmRole::User => "user",
            crate::types::LlmRole::Assistant => "assistant",
        };
        Self { role, content: msg.content.clone() }
    }
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    choices: Vec<WireChoice>,
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    message: WireResponseMessage,
}

#[derive(Debug, Deserialize)]
struct WireResponseMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    total_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct WireStreamChunk {
    choices: Vec<WireStreamChoice>,
}

#[derive(Debug, Deserialize)]
struct WireStreamChoice {
    delta: WireDelta,
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct WireDelta {
    content: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::NoopMetricsSink;

    #[test]
    fn rejects_non_https_endpoint() {
        let err = OpenaiProvider::new("http://example.com/v1/", "key", "gpt", Arc::new(NoopMetricsSink)).unwrap_err();
        assert!(matches!(err, LlmError::Config(_)));
    }

    #[tokio::test]
    async fn send_parses_choice_and_usage() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/v1/chat/completions")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"choices":[{"message":{"content":"hi there"}}],"usage":{"total_tokens":7}}"#)
            .create_async()
            .await;

        let provider = OpenaiProvider::new_unchecked(
            &format!("{}/v1/", server.url()),
            "key",
            "gpt-test",
            Arc::new(NoopMetricsSink),
        );

        let history = [LlmMessage::new(crate::types::LlmRole::User, "hello")];
        let response = provider.send(&history).await.unwrap();
        assert_eq!(response.content, "hi there");
        assert_eq!(response.tokens_used, 7);
    }

    #[tokio::test]
    async fn send_surfaces_upstream_error_with_truncated_body() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server.mock("POST", "/v1/chat/completions").with_status(503).with_body("boom").create_async().await;

        let provider = OpenaiProvider::new_unchecked(
            &format!("{}/v1/", server.url()),
            "key",
            "gpt-test",
            Arc::new(NoopMetricsSink),
        );

        let history = [LlmMessage::new(crate::types::LlmRole::User, "hello")];
        let err = provider.send(&history).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(matches!(err, LlmError::Upstream { status: 503, .. }));
    }
}
