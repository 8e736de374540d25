//! Per-vendor SSE dialect codecs over the common `Provider` capability
//! (§4.5). Shared here: endpoint validation, the two HTTP client
//! configurations every adapter needs, and the response-header gate used to
//! treat "stream establishment" as retryable without retrying mid-stream.

pub mod anthropic;
pub mod dify;
pub mod openai;

pub use anthropic::AnthropicProvider;
pub use dify::DifyProvider;
pub use openai::OpenaiProvider;

use std::time::Duration;

use reqwest::Client;
use reqwest_eventsource::{Error as EsError, Event, EventSource};
use url::Url;

use crate::error::{truncate_body, LlmError};

/// Non-streaming requests get a single end-to-end deadline (§4.5).
pub(crate) const NON_STREAM_TIMEOUT: Duration = Duration::from_secs(60);
/// Streaming requests have no overall deadline, but the TCP handshake and
/// the wait for the first response byte are bounded (§4.5).
pub(crate) const STREAM_HEADER_TIMEOUT: Duration = Duration::from_secs(30);

/// Validates a configured provider endpoint: must parse, scheme `https`,
/// non-empty host. Internal IPs are fine as long as the scheme is https
/// (§6 config validation).
pub fn validate_endpoint(endpoint: &str) -> Result<Url, LlmError> {
    let url = Url::parse(endpoint)
        .map_err(|e| LlmError::Config(format!("invalid endpoint {endpoint}: {e}")))?;
    if url.scheme() != "https" {
        return Err(LlmError::Config(format!("endpoint {endpoint} must use https")));
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(LlmError::Config(format!("endpoint {endpoint} is missing a host")));
    }
    Ok(url)
}

/// Builds the two client configurations every provider adapter owns: a
/// bounded-total-timeout client for `send`, and a connect-bounded client
/// for `stream` (reqwest has no first-party response-header timeout knob;
/// [`open_event_source`] enforces the header wait explicitly instead).
pub(crate) fn build_clients() -> Result<(Client, Client), LlmError> {
    let send = Client::builder()
        .timeout(NON_STREAM_TIMEOUT)
        .build()
        .map_err(|e| LlmError::Config(format!("building send client: {e}")))?;
    let stream = Client::builder()
        .connect_timeout(STREAM_HEADER_TIMEOUT)
        .build()
        .map_err(|e| LlmError::Config(format!("building stream client: {e}")))?;
    Ok((send, stream))
}

/// Drives `event_source` until its synthesized `Event::Open` (always the
/// first item on success) arrives, under [`STREAM_HEADER_TIMEOUT`]. This is
/// the part of stream establishment the §4.5 retry policy covers; once this
/// returns `Ok`, the caller owns `event_source` for the remainder of the
/// stream and errors from here on are no longer retried.
pub(crate) async fn open_event_source(mut event_source: EventSource) -> Result<EventSource, LlmError> {
    match tokio::time::timeout(STREAM_HEADER_TIMEOUT, futures::StreamExt::next(&mut event_source)).await {
        Ok(Some(Ok(Event::Open))) => Ok(event_source),
        Ok(Some(Ok(Event::Message(_)))) => Ok(event_source),
        Ok(Some(Err(EsError::InvalidStatusCode(status, response)))) => {
            let body = response.text().await.unwrap_or_default();
            Err(LlmError::Upstream { status: status.as_u16(), body: truncate_body(&body) })
        }
        Ok(Some(Err(e))) => Err(LlmError::Request(e.to_string())),
        Ok(None) => Err(LlmError::Request("stream closed before any event".into())),
        Err(_) => Err(LlmError::Request("timeout waiting for response headers".into())),
    }
}
