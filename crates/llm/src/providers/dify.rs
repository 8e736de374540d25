//! Dify `/chat-messages` dialect (§4.5): Bearer auth, `data:` JSON per
//! chunk. `event: "message"` carries `answer`; `event: "message_end"` and
//! `event: "error"` both end the stream.

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

pub struct DifyProvider {
    /// Dify addresses conversations by the app's configured model, not a
    /// per-request model name; kept for `Provider::provider_type`/logging.
    model: String,
    endpoint: Url,
    api_key: String,
    send_client: Client,
    stream_client: Client,
    metrics: Arc<dyn LlmMetricsSink>,
}

impl DifyProvider {
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
        format!("{}chat-messages", self.endpoint)
    }

    /// Dify takes one query plus the running conversation as server-side
    /// state; this adapter folds all but the last history entry into the
    /// query since the crate has no conversation-id persistence (the
    /// gateway's `SessionManager` already carries that context).
    fn to_wire(&self, history: &[LlmMessage], stream: bool) -> WireRequest {
        let query = history.last().map(|m| m.content.clone()).unwrap_or_default();
        WireRequest {
            query,
            response_mode: if stream { "streaming" } else { "blocking" },
            user: "chatgate".to_string(),
        }
    }
}

#[async_trait]
impl Provider for DifyProvider {
    fn provider_type(&self) -> ProviderType {
        ProviderType::Dify
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

        let parsed: WireBlockingResponse =
            response.json().await.map_err(|e| LlmError::Request(e.to_string()))?;

        Ok(LlmResponse {
            content: parsed.answer,
            tokens_used: parsed.metadata.and_then(|m| m.usage).map(|u| u.total_tokens).unwrap_or_default(),
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
        let rx = spawn_guarded("dify", metrics, move |tx| {
            Box::new(async move { run_producer(event_source, tx).await })
        });
        Ok(ReceiverStream::new(rx).boxed())
    }
}

async fn run_producer(mut event_source: EventSource, tx: crate::stream_guard::ChunkSender) {
    while let Some(event) = event_source.next().await {
        match event {
            Ok(Event::Open) => continue,
            Ok(Event::Message(message)) => match serde_json::from_str::<WireStreamChunk>(&message.data) {
                Ok(chunk) => match chunk.event.as_str() {
                    "message" => {
                        if let Some(answer) = chunk.answer {
                            if !answer.is_empty() && tx.send(Ok(LlmChunk::delta(answer))).await.is_err() {
                                return;
                            }
                        }
                    }
                    "message_end" => {
                        let _ = tx.send(Ok(LlmChunk::done())).await;
                        break;
                    }
                    "error" => {
                        let message = chunk.message.unwrap_or_else(|| "provider reported an error".into());
                        let _ = tx.send(Err(LlmError::Stream(message))).await;
                        let _ = tx.send(Ok(LlmChunk::done())).await;
                        break;
                    }
                    _ => continue,
                },
                Err(_) => continue,
            },
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
    query: String,
    response_mode: &'static str,
    user: String,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    total_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct WireMetadata {
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct WireBlockingResponse {
    answer: String,
    metadata: Option<WireMetadata>,
}

#[derive(Debug, Deserialize)]
struct WireStreamChunk {
    event: String,
    #[serde(default)]
    answer: Option<String>,
    #[serde(default)]
    message: Option<String>,
}
