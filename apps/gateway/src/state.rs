// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

use std::sync::{Arc, OnceLock};

use chatgate_llm::providers::{AnthropicProvider, DifyProvider, OpenaiProvider};
use chatgate_llm::{LlmMetricsSink, LlmService, ModelInfo, Provider, RetryPolicy};
use opentelemetry::{global, KeyValue};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::{Config, ProviderTypeConfig};
use crate::rate_limiter::RateLimiter;
use crate::registry::ConnectionRegistry;
use crate::session_manager::SessionManager;
use crate::store::MemoryStore;

/// OTel-backed implementation of the narrow metrics capability
/// `chatgate-llm` consumes, wired up at the gateway boundary so the
/// provider crate never has to pin an `opentelemetry` version (§9).
struct OtelLlmMetrics {
    requests: opentelemetry::metrics::Counter<u64>,
    errors: opentelemetry::metrics::Counter<u64>,
}

impl OtelLlmMetrics {
    fn shared() -> Arc<Self> {
        static METRICS: OnceLock<Arc<OtelLlmMetrics>> = OnceLock::new();
        METRICS
            .get_or_init(|| {
                let meter = global::meter("chatgate_llm");
                Arc::new(Self {
                    requests: meter.u64_counter("chatgate.llm.provider_requests").build(),
                    errors: meter.u64_counter("chatgate.llm.provider_errors").build(),
                })
            })
            .clone()
    }
}

impl LlmMetricsSink for OtelLlmMetrics {
    fn record_provider_error(&self, provider: &str) {
        self.errors.add(1, &[KeyValue::new("provider", provider.to_string())]);
    }

    fn record_request(&self, provider: &str) {
        self.requests.add(1, &[KeyValue::new("provider", provider.to_string())]);
    }
}

fn build_provider(
    provider_type: ProviderTypeConfig,
    endpoint: &str,
    api_key: &str,
    model: &str,
    metrics: Arc<dyn LlmMetricsSink>,
) -> Result<Arc<dyn Provider>, chatgate_llm::LlmError> {
    Ok(match provider_type {
        ProviderTypeConfig::Openai => Arc::new(OpenaiProvider::new(endpoint, api_key, model, metrics)?),
        ProviderTypeConfig::Anthropic => Arc::new(AnthropicProvider::new(endpoint, api_key, model, metrics)?),
        ProviderTypeConfig::Dify => Arc::new(DifyProvider::new(endpoint, api_key, model, metrics)?),
    })
}

fn build_llm_service(config: &Config) -> LlmService {
    let mut service = LlmService::new(RetryPolicy::default());
    let metrics: Arc<dyn LlmMetricsSink> = OtelLlmMetrics::shared();

    for provider_config in &config.llm.providers {
        let info = ModelInfo {
            id: provider_config.id.clone(),
            name: provider_config.name.clone(),
            provider_type: provider_config.provider_type.into(),
            endpoint: provider_config.endpoint.clone(),
        };
        match build_provider(
            provider_config.provider_type,
            &provider_config.endpoint,
            &provider_config.api_key,
            &provider_config.model,
            Arc::clone(&metrics),
        ) {
            Ok(provider) => service.register(info, provider),
            Err(e) => {
                warn!(model_id = %provider_config.id, error = %e, "skipping misconfigured LLM provider");
            },
        }
    }

    service
}

/// The process-wide dependencies every connection handler shares (§2):
/// the connection registry, session manager, rate limiter, and LLM
/// service, plus the resolved configuration and the root cancellation
/// token that drives shutdown.
pub struct AppState {
    pub config: Config,
    pub registry: Arc<ConnectionRegistry>,
    pub sessions: Arc<SessionManager>,
    pub rate_limiter: Arc<RateLimiter>,
    pub llm: Arc<LlmService>,
    pub shutdown_cancel: CancellationToken,
}

impl AppState {
    #[must_use]
    pub fn new(config: Config) -> Self {
        let rate_limiter = Arc::new(RateLimiter::new(&config.server.rate_limit));
        let store = Arc::new(MemoryStore::new());
        let sessions = Arc::new(SessionManager::new(
            store,
            std::time::Duration::from_secs(config.server.reconnect_timeout_secs),
            std::time::Duration::from_secs(config.server.session_ttl_secs),
        ));
        let llm = Arc::new(build_llm_service(&config));

        Self {
            registry: Arc::new(ConnectionRegistry::new()),
            sessions,
            rate_limiter,
            llm,
            shutdown_cancel: CancellationToken::new(),
            config,
        }
    }
}
