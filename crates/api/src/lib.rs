//! api: Defines the WebSocket wire contract for chatgate (§6).
//!
//! All client/server communication is UTF-8 JSON, one message per frame.
//! Every frame is an [`Envelope`] wrapping either an [`InboundPayload`]
//! (client → server) or an [`OutboundPayload`] (server → client). The
//! envelope's `type` field and the payload are adjacently tagged so the
//! wire shape is exactly:
//!
//! ```json
//! { "type": "user.message", "sessionId": "...", "payload": { "content": "Hi" },
//!   "correlationId": null, "ts": "2026-07-26T00:00:00Z" }
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Generic envelope shared by inbound and outbound frames (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<T> {
    #[serde(flatten)]
    pub body: T,
    #[serde(rename = "sessionId", default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(rename = "correlationId", default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(rename = "ts", default = "now")]
    pub ts: DateTime<Utc>,
}

impl<T> Envelope<T> {
    #[must_use]
    pub fn new(body: T, session_id: Option<String>) -> Self {
        Self { body, session_id, correlation_id: None, ts: Utc::now() }
    }

    #[must_use]
    pub fn with_correlation(mut self, correlation_id: Option<String>) -> Self {
        self.correlation_id = correlation_id;
        self
    }
}

/// Inbound (client → server) frame kinds (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum InboundPayload {
    #[serde(rename = "user.message")]
    UserMessage {
        content: String,
        #[serde(rename = "modelId", default, skip_serializing_if = "Option::is_none")]
        model_id: Option<String>,
    },
    #[serde(rename = "user.switch_model")]
    UserSwitchModel {
        #[serde(rename = "modelId")]
        model_id: String,
    },
    #[serde(rename = "admin.takeover")]
    AdminTakeover {},
    #[serde(rename = "admin.release")]
    AdminRelease {},
    #[serde(rename = "admin.message")]
    AdminMessage { content: String },
    #[serde(rename = "session.end")]
    SessionEnd {},
    #[serde(rename = "ping")]
    Ping {},
}

pub type Inbound = Envelope<InboundPayload>;

/// Model identity surfaced in `session.attached` (§6).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub name: String,
}

/// Outbound (server → client) frame kinds (§6).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum OutboundPayload {
    #[serde(rename = "session.attached")]
    SessionAttached {
        #[serde(rename = "sessionId")]
        session_id: String,
        resumed: bool,
        model: Option<ModelInfo>,
    },
    #[serde(rename = "ai.delta")]
    AiDelta { content: String },
    #[serde(rename = "ai.complete")]
    AiComplete {
        #[serde(rename = "tokensUsed")]
        tokens_used: u32,
        #[serde(rename = "durationMs")]
        duration_ms: u64,
    },
    #[serde(rename = "ai.error")]
    AiError {
        code: String,
        message: String,
        #[serde(rename = "correlationId", default, skip_serializing_if = "Option::is_none")]
        correlation_id: Option<String>,
    },
    #[serde(rename = "admin.message")]
    AdminMessage { content: String },
    #[serde(rename = "session.takeover")]
    SessionTakeover {},
    #[serde(rename = "session.released")]
    SessionReleased {},
    #[serde(rename = "session.ended")]
    SessionEnded { reason: String },
    #[serde(rename = "rate_limited")]
    RateLimited {
        #[serde(rename = "retryAfterMs")]
        retry_after_ms: u64,
    },
}

pub type Outbound = Envelope<OutboundPayload>;

impl Outbound {
    #[must_use]
    pub fn for_session(session_id: impl Into<String>, body: OutboundPayload) -> Self {
        Envelope::new(body, Some(session_id.into()))
    }
}

impl OutboundPayload {
    /// Whether this frame is a control frame exempt from the send queue's
    /// drop-oldest-non-control overflow policy (§4.3/§5): session lifecycle
    /// announcements and errors, as opposed to streamed reply content.
    #[must_use]
    pub const fn is_control(&self) -> bool {
        !matches!(self, Self::AiDelta { .. } | Self::AiComplete { .. } | Self::AdminMessage { .. })
    }
}

/// WebSocket close codes used by the gateway (§6).
pub mod close_code {
    pub const GOING_AWAY: u16 = 1001;
    pub const POLICY_VIOLATION: u16 = 1008;
    pub const MESSAGE_TOO_BIG: u16 = 1009;
    pub const INTERNAL_ERROR: u16 = 1011;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trips_recognized_fields() {
        let original = Envelope::new(
            InboundPayload::UserMessage { content: "Hi".into(), model_id: Some("m1".into()) },
            Some("sess1".into()),
        )
        .with_correlation(Some("corr1".into()));

        let json = serde_json::to_string(&original).unwrap();
        let parsed: Inbound = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.session_id.as_deref(), Some("sess1"));
        assert_eq!(parsed.correlation_id.as_deref(), Some("corr1"));
        match parsed.body {
            InboundPayload::UserMessage { content, model_id } => {
                assert_eq!(content, "Hi");
                assert_eq!(model_id.as_deref(), Some("m1"));
            },
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn wire_shape_matches_spec_envelope() {
        let env = Outbound::for_session("sess1", OutboundPayload::AiDelta { content: "Hel".into() });
        let value: serde_json::Value = serde_json::to_value(&env).unwrap();
        assert_eq!(value["type"], "ai.delta");
        assert_eq!(value["payload"]["content"], "Hel");
        assert_eq!(value["sessionId"], "sess1");
    }

    #[test]
    fn unknown_fields_do_not_error() {
        let raw = r#"{"type":"ping","payload":{},"sessionId":"s1","extra":"ignored"}"#;
        let parsed: Inbound = serde_json::from_str(raw).unwrap();
        assert!(matches!(parsed.body, InboundPayload::Ping {}));
    }

    #[test]
    fn only_streamed_content_frames_are_non_control() {
        assert!(!OutboundPayload::AiDelta { content: "hi".into() }.is_control());
        assert!(!OutboundPayload::AiComplete { tokens_used: 1, duration_ms: 1 }.is_control());
        assert!(!OutboundPayload::AdminMessage { content: "hi".into() }.is_control());
        assert!(OutboundPayload::SessionTakeover {}.is_control());
        assert!(OutboundPayload::SessionReleased {}.is_control());
        assert!(OutboundPayload::SessionEnded { reason: "x".into() }.is_control());
        assert!(OutboundPayload::RateLimited { retry_after_ms: 1 }.is_control());
        assert!(OutboundPayload::AiError { code: "x".into(), message: "x".into(), correlation_id: None }
            .is_control());
    }
}
