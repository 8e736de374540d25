//! `LLMService` (§4.5): a capability registry mapping `modelId -> Provider`,
//! built once at startup and immutable thereafter except for the
//! test-only `register` escape hatch.

use std::collections::HashMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::error::LlmError;
use crate::provider::{ChunkStream, Provider};
use crate::retry::{retry_with_backoff, RetryPolicy};
use crate::types::{LlmMessage, LlmResponse, ModelInfo};

struct Entry {
    info: ModelInfo,
    provider: Arc<dyn Provider>,
}

pub struct LlmService {
    entries: HashMap<String, Entry>,
    retry_policy: RetryPolicy,
}

impl LlmService {
    #[must_use]
    pub fn new(retry_policy: RetryPolicy) -> Self {
        Self { entries: HashMap::new(), retry_policy }
    }

    /// Registers a model under `model_id`. Called at startup from
    /// configuration; also used by tests to wire in fakes.
    pub fn register(&mut self, info: ModelInfo, provider: Arc<dyn Provider>) {
        self.entries.insert(info.id.clone(), Entry { info, provider });
    }

    #[must_use]
    pub fn list_models(&self) -> Vec<ModelInfo> {
        self.entries.values().map(|e| e.info.clone()).collect()
    }

    pub fn validate(&self, model_id: &str) -> Result<(), LlmError> {
        if self.entries.contains_key(model_id) {
            Ok(())
        } else {
            Err(LlmError::ModelNotFound(model_id.to_string()))
        }
    }

    fn lookup(&self, model_id: &str) -> Result<Arc<dyn Provider>, LlmError> {
        self.entries
            .get(model_id)
            .map(|e| e.provider.clone())
            .ok_or_else(|| LlmError::ModelNotFound(model_id.to_string()))
    }

    /// `Send(ctx, modelID, history)` (§4.5). Retries transient failures;
    /// on retry exhaustion the error becomes `UpstreamUnavailable`.
    pub async fn send(
        &self,
        cancel: &CancellationToken,
        model_id: &str,
        history: &[LlmMessage],
    ) -> Result<LlmResponse, LlmError> {
        let provider = self.lookup(model_id)?;
        retry_with_backoff(&self.retry_policy, cancel, |_attempt| {
            let provider = provider.clone();
            async move { provider.send(history).await }
        })
        .await
    }

    /// `Stream(ctx, modelID, history)` (§4.5). Retries stream
    /// *establishment* only; once a stream is returned, mid-stream errors
    /// surface through the chunk sequence itself, never here.
    pub async fn stream(
        &self,
        cancel: &CancellationToken,
        model_id: &str,
        history: &[LlmMessage],
    ) -> Result<ChunkStream, LlmError> {
        let provider = self.lookup(model_id)?;
        retry_with_backoff(&self.retry_policy, cancel, |_attempt| {
            let provider = provider.clone();
            async move { provider.stream(history).await }
        })
        .await
    }

    /// `CountTokens(modelID, text)` (§4.5): floor(len/4) approximation,
    /// delegated to the provider so a future adapter can override it with
    /// a real tokenizer.
    pub fn count_tokens(&self, model_id: &str, text: &str) -> Result<usize, LlmError> {
        Ok(self.lookup(model_id)?.count_tokens(text))
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use futures::stream;
    use futures::StreamExt;

    use super::*;
    use crate::types::{LlmChunk, ProviderType};

    struct FlakyProvider {
        remaining_failures: std::sync::atomic::AtomicU32,
    }

    #[async_trait]
    impl Provider for FlakyProvider {
        fn provider_type(&self) -> ProviderType {
            ProviderType::Openai
        }

        async fn send(&self, _history: &[LlmMessage]) -> Result<LlmResponse, LlmError> {
            if self.remaining_failures.fetch_sub(1, std::sync::atomic::Ordering::SeqCst) > 0 {
                Err(LlmError::Upstream { status: 503, body: String::new() })
            } else {
                Ok(LlmResponse { content: "ok".into(), tokens_used: 1, duration: std::time::Duration::ZERO })
            }
        }

        async fn stream(&self, _history: &[LlmMessage]) -> Result<ChunkStream, LlmError> {
            Ok(stream::iter(vec![Ok(LlmChunk::delta("hi")), Ok(LlmChunk::done())]).boxed())
        }
    }

    fn model_info(id: &str) -> ModelInfo {
        ModelInfo { id: id.into(), name: id.into(), provider_type: ProviderType::Openai, endpoint: "https://example.com/".into() }
    }

    #[tokio::test]
    async fn unknown_model_is_not_found() {
        let service = LlmService::new(RetryPolicy::default());
        let err = service.validate("missing").unwrap_err();
        assert!(matches!(err, LlmError::ModelNotFound(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn send_retries_then_succeeds() {
        let mut service = LlmService::new(RetryPolicy::default());
        let provider = Arc::new(FlakyProvider { remaining_failures: std::sync::atomic::AtomicU32::new(2) });
        service.register(model_info("m1"), provider);

        let cancel = CancellationToken::new();
        let response = service.send(&cancel, "m1", &[]).await.unwrap();
        assert_eq!(response.content, "ok");
    }

    #[tokio::test]
    async fn stream_forwards_provider_chunks() {
        let mut service = LlmService::new(RetryPolicy::default());
        let provider = Arc::new(FlakyProvider { remaining_failures: std::sync::atomic::AtomicU32::new(0) });
        service.register(model_info("m1"), provider);

        let cancel = CancellationToken::new();
        let mut chunks = service.stream(&cancel, "m1", &[]).await.unwrap();
        let first = chunks.next().await.unwrap().unwrap();
        assert_eq!(first.content, "hi");
    }

    #[test]
    fn count_tokens_delegates_to_provider() {
        let mut service = LlmService::new(RetryPolicy::default());
        let provider = Arc::new(FlakyProvider { remaining_failures: std::sync::atomic::AtomicU32::new(0) });
        service.register(model_info("m1"), provider);
        assert_eq!(service.count_tokens("m1", "12345678").unwrap(), 2);
    }
}
