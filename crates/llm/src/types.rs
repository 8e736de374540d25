//! Transport types carried across the `Provider` boundary (§3).

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Role of one turn in the conversation history handed to a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmRole {
    System,
    User,
    Assistant,
}

/// One turn of conversation history, independent of the wire envelope
/// (`chatgate-api`) or the persisted `Message` (`chatgate-core`) shapes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmMessage {
    pub role: LlmRole,
    pub content: String,
}

impl LlmMessage {
    #[must_use]
    pub fn new(role: LlmRole, content: impl Into<String>) -> Self {
        Self { role, content: content.into() }
    }
}

/// A completed (non-streaming) provider response.
#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub content: String,
    pub tokens_used: u32,
    pub duration: Duration,
}

/// One chunk of a streamed provider response. Exactly one chunk per stream
/// carries `done: true`, and it is always the last (§3).
#[derive(Debug, Clone, Default)]
pub struct LlmChunk {
    pub content: String,
    pub done: bool,
}

impl LlmChunk {
    #[must_use]
    pub fn delta(content: impl Into<String>) -> Self {
        Self { content: content.into(), done: false }
    }

    #[must_use]
    pub fn done() -> Self {
        Self { content: String::new(), done: true }
    }
}

/// Kind of upstream dialect a configured model speaks (§4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderType {
    Openai,
    Anthropic,
    Dify,
}

/// Registry entry surfaced by `LlmService::list_models` (§4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub name: String,
    pub provider_type: ProviderType,
    pub endpoint: String,
}
