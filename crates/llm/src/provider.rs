//! The `Provider` capability (§4.5, §9: "dynamic dispatch over providers —
//! a closed set of three variants behind a capability `{Send, Stream,
//! CountTokens}`"). Modeled on `locus_codes_llms::provider::Provider`: one
//! trait object per configured model, registered into `LlmService` at
//! startup.

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::LlmError;
use crate::types::{LlmChunk, LlmMessage, LlmResponse, ProviderType};

pub type ChunkStream = BoxStream<'static, Result<LlmChunk, LlmError>>;

#[async_trait]
pub trait Provider: Send + Sync {
    fn provider_type(&self) -> ProviderType;

    async fn send(&self, history: &[LlmMessage]) -> Result<LlmResponse, LlmError>;

    async fn stream(&self, history: &[LlmMessage]) -> Result<ChunkStream, LlmError>;

    /// Approximate token count (§4.5: "approximation: floor(len/4)").
    /// Providers with a real tokenizer may override this.
    fn count_tokens(&self, text: &str) -> usize {
        text.len() / 4
    }
}
