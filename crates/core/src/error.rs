//! Structured error types for chatgate.
//!
//! This module provides a hierarchy of error types for better error handling
//! and programmatic error inspection. Each variant maps to one category of
//! the error taxonomy: bad client input, authorization, rate limiting,
//! transient upstream failure, persistence failure, cancellation, or an
//! unexpected internal fault. No variant carries provider response bodies,
//! database error text, or stack traces — those are logged server-side and
//! never placed in the `Display` output that crosses the wire.

use thiserror::Error;

/// Main error type for chatgate core operations.
#[derive(Debug, Error)]
pub enum ChatGateError {
    /// Malformed client frame, unknown model, empty message, etc.
    #[error("validation error: {0}")]
    Validation(String),

    /// Caller lacks the role required for the requested action.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Referenced session/connection/model does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A per-user connection or message-rate limit was exceeded.
    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    /// Per-user concurrent connection cap would be exceeded.
    #[error("connection limit exceeded for user")]
    LimitExceeded,

    /// Upstream provider call failed after exhausting retries.
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// `SessionStore` operation failed after exhausting retries.
    #[error("persistence failed: {0}")]
    PersistenceFailed(String),

    /// Caller-driven cancellation (shutdown, disconnect). Not surfaced to
    /// the client as an error — frames simply stop.
    #[error("cancelled")]
    Cancelled,

    /// Anything unexpected; recovered from a panic or otherwise unclassified.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ChatGateError {
    /// The stable wire error code used in `ai.error{code}` frames (§6/§7).
    #[must_use]
    pub fn wire_code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Forbidden(_) => "forbidden",
            Self::NotFound(_) => "not_found",
            Self::RateLimited { .. } => "rate_limited",
            Self::LimitExceeded => "limit_exceeded",
            Self::UpstreamUnavailable(_) => "upstream_unavailable",
            Self::PersistenceFailed(_) => "persistence_failed",
            Self::Cancelled => "cancelled",
            Self::Internal(_) => "internal",
        }
    }
}

/// Convenience type alias for Results using `ChatGateError`.
pub type Result<T> = std::result::Result<T, ChatGateError>;

impl From<String> for ChatGateError {
    fn from(s: String) -> Self {
        Self::Internal(s)
    }
}

impl From<&str> for ChatGateError {
    fn from(s: &str) -> Self {
        Self::Internal(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_has_no_internal_detail() {
        let err = ChatGateError::Validation("content must not be empty".to_string());
        assert_eq!(err.to_string(), "validation error: content must not be empty");
        assert_eq!(err.wire_code(), "validation");
    }

    #[test]
    fn rate_limited_carries_retry_after() {
        let err = ChatGateError::RateLimited { retry_after_ms: 1000 };
        assert_eq!(err.to_string(), "rate limited, retry after 1000ms");
        assert_eq!(err.wire_code(), "rate_limited");
    }

    #[test]
    fn string_conversion_is_internal() {
        let err: ChatGateError = "boom".into();
        assert_eq!(err.wire_code(), "internal");
    }
}
