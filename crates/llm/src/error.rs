//! Error taxonomy for `chatgate-llm` (§7: Transient/retryable surfaces as
//! `UpstreamUnavailable` on retry exhaustion, everything else passes through
//! unchanged to the caller).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("model not registered: {0}")]
    ModelNotFound(String),

    #[error("invalid provider configuration: {0}")]
    Config(String),

    #[error("provider request failed: {0}")]
    Request(String),

    #[error("provider returned {status}: {body}")]
    Upstream { status: u16, body: String },

    #[error("upstream unavailable after retries")]
    UpstreamUnavailable,

    #[error("cancelled")]
    Cancelled,

    #[error("stream error: {0}")]
    Stream(String),
}

/// Substrings that mark an error transient per §4.5's retry policy. Checked
/// case-insensitively against request-layer error text and (for non-2xx
/// responses) the truncated response body.
const RETRYABLE_NEEDLES: &[&str] = &[
    "connection refused",
    "connection reset",
    "timeout",
    "eof",
    "temporary",
    "rate limit",
    "unavailable",
    "overloaded",
];

impl LlmError {
    /// Whether this error should be retried per §4.5 (Send and
    /// stream-establishment only, never mid-stream).
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Upstream { status, body } => {
                *status >= 500 || *status == 429 || Self::sniff(body)
            }
            Self::Request(msg) => Self::sniff(msg),
            Self::ModelNotFound(_)
            | Self::Config(_)
            | Self::UpstreamUnavailable
            | Self::Cancelled
            | Self::Stream(_) => false,
        }
    }

    fn sniff(text: &str) -> bool {
        let lower = text.to_ascii_lowercase();
        RETRYABLE_NEEDLES.iter().any(|needle| lower.contains(needle))
    }
}

/// Truncates a provider error body to at most 1024 bytes, at a valid UTF-8
/// boundary, so logs never retain megabytes of an HTML error page (§4.5).
#[must_use]
pub fn truncate_body(body: &str) -> String {
    const MAX_BYTES: usize = 1024;
    if body.len() <= MAX_BYTES {
        return body.to_string();
    }
    let mut end = MAX_BYTES;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}... (truncated)", &body[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_statuses() {
        assert!(LlmError::Upstream { status: 503, body: String::new() }.is_retryable());
        assert!(LlmError::Upstream { status: 429, body: String::new() }.is_retryable());
        assert!(!LlmError::Upstream { status: 404, body: String::new() }.is_retryable());
    }

    #[test]
    fn retryable_body_sniff() {
        assert!(LlmError::Upstream { status: 400, body: "server overloaded".into() }.is_retryable());
    }

    #[test]
    fn request_error_sniff() {
        assert!(LlmError::Request("connection reset by peer".into()).is_retryable());
        assert!(!LlmError::Request("invalid json".into()).is_retryable());
    }

    #[test]
    fn non_retryable_categories() {
        assert!(!LlmError::ModelNotFound("m1".into()).is_retryable());
        assert!(!LlmError::Cancelled.is_retryable());
    }

    #[test]
    fn truncate_respects_utf8_boundary_and_cap() {
        let body = "a".repeat(2000);
        let truncated = truncate_body(&body);
        assert!(truncated.len() < body.len());
        assert!(truncated.ends_with("... (truncated)"));
    }

    #[test]
    fn truncate_passes_through_short_body() {
        assert_eq!(truncate_body("short"), "short");
    }
}
