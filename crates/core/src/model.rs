//! Domain model (§3): `Session`, `Message`, `Sender`, and the connection
//! metadata shared between the registry and the session manager.
//!
//! These types carry no transport- or storage-specific detail — they are
//! passed between `chatgate-gateway`'s modules and handed to a
//! [`crate::store::SessionStore`] implementation for persistence.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Who produced a [`Message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    User,
    Ai,
    Admin,
}

/// One turn in a [`Session`]'s transcript.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub sender: Sender,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
}

/// Errors from constructing or mutating a [`Message`]/[`Session`] that would
/// otherwise violate a data-model invariant (§3).
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ModelError {
    #[error("content must not be empty for sender {0:?}")]
    EmptyContent(Sender),
    #[error("ai messages must carry a model id and token count")]
    MissingAiMetadata,
    #[error("message timestamp precedes session start")]
    TimestampBeforeStart,
}

impl Message {
    /// Construct a message, enforcing the §3 invariants:
    /// content is non-empty for `user`/`admin`, and `ai` messages carry
    /// `model_id` + `token_count`.
    pub fn new(
        content: impl Into<String>,
        sender: Sender,
        model_id: Option<String>,
        token_count: Option<u32>,
    ) -> Result<Self, ModelError> {
        let content = content.into();
        if sender != Sender::Ai && content.trim().is_empty() {
            return Err(ModelError::EmptyContent(sender));
        }
        if sender == Sender::Ai && (model_id.is_none() || token_count.is_none()) {
            return Err(ModelError::MissingAiMetadata);
        }
        Ok(Self { content, timestamp: Utc::now(), sender, token_count, model_id })
    }
}

/// One user conversation (§3).
///
/// Invariants upheld by this type's methods (never by direct field
/// mutation from outside the crate):
/// - `end_time` is `Some` iff `is_active == false`.
/// - `total_tokens` is the sum of `token_count` over `ai`-sender messages.
/// - `messages` is append-only and timestamp-ordered within
///   `[start_time, end_time]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub user_id: String,
    pub messages: Vec<Message>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub admin_assisted: bool,
    pub current_model_id: Option<String>,
    pub total_tokens: u64,
    /// Per-request response durations, most recent last.
    pub response_durations: Vec<std::time::Duration>,
    pub current_owner_connection_id: Option<String>,
    pub last_activity: DateTime<Utc>,
}

impl Session {
    /// Create a new active session owned by `connection_id`.
    #[must_use]
    pub fn new(session_id: String, user_id: String, connection_id: String) -> Self {
        let now = Utc::now();
        Self {
            session_id,
            user_id,
            messages: Vec::new(),
            start_time: now,
            end_time: None,
            is_active: true,
            admin_assisted: false,
            current_model_id: None,
            total_tokens: 0,
            response_durations: Vec::new(),
            current_owner_connection_id: Some(connection_id),
            last_activity: now,
        }
    }

    /// Append a message, enforcing ordering and updating `total_tokens` and
    /// `last_activity`. Rejects messages timestamped before `start_time`.
    pub fn append_message(&mut self, msg: Message) -> Result<(), ModelError> {
        if msg.timestamp < self.start_time {
            return Err(ModelError::TimestampBeforeStart);
        }
        if msg.sender == Sender::Ai {
            self.total_tokens += u64::from(msg.token_count.unwrap_or(0));
        }
        self.last_activity = msg.timestamp.max(Utc::now());
        self.messages.push(msg);
        Ok(())
    }

    /// Record a completed request's duration (used for latency metrics and
    /// testable-property §8 bookkeeping).
    pub fn record_duration(&mut self, dur: std::time::Duration) {
        self.response_durations.push(dur);
    }

    /// End the session: sets `end_time`, clears `is_active`.
    pub fn end(&mut self, now: DateTime<Utc>) {
        self.is_active = false;
        self.end_time = Some(now);
        self.current_owner_connection_id = None;
    }

    /// Whether the session is eligible for `AttachOrResume` given the
    /// configured reconnect window.
    #[must_use]
    pub fn is_resumable(&self, now: DateTime<Utc>, reconnect_timeout: chrono::Duration) -> bool {
        self.is_active
            && self.current_owner_connection_id.is_none()
            && now - self.last_activity < reconnect_timeout
    }

    /// Whether the session has exceeded the absolute idle TTL, or the
    /// reconnect window while disconnected — i.e. the sweeper should end it.
    #[must_use]
    pub fn is_expired(
        &self,
        now: DateTime<Utc>,
        reconnect_timeout: chrono::Duration,
        session_ttl: chrono::Duration,
    ) -> bool {
        if !self.is_active {
            return false;
        }
        let idle = now - self.last_activity;
        if self.current_owner_connection_id.is_none() && idle > reconnect_timeout {
            return true;
        }
        idle > session_ttl
    }
}

/// Roles a pre-authenticated caller may carry (§3 Connection, §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Admin,
    ChatAdmin,
}

/// Pre-authenticated identity delivered to the gateway (JWT parsing is a
/// non-goal — see §1).
#[derive(Debug, Clone)]
pub struct Identity {
    pub user_id: String,
    pub roles: Vec<Role>,
}

impl Identity {
    #[must_use]
    pub fn has_admin(&self) -> bool {
        self.roles.iter().any(|r| matches!(r, Role::Admin | Role::ChatAdmin))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ai_message_requires_model_and_tokens() {
        let err = Message::new("hi", Sender::Ai, None, None).unwrap_err();
        assert_eq!(err, ModelError::MissingAiMetadata);
    }

    #[test]
    fn user_message_requires_nonempty_content() {
        let err = Message::new("   ", Sender::User, None, None).unwrap_err();
        assert_eq!(err, ModelError::EmptyContent(Sender::User));
    }

    #[test]
    fn total_tokens_sums_only_ai_messages() {
        let mut session = Session::new("s1".into(), "u1".into(), "c1".into());
        session
            .append_message(Message::new("hi", Sender::User, None, None).unwrap())
            .unwrap();
        session
            .append_message(
                Message::new("hello", Sender::Ai, Some("m1".into()), Some(5)).unwrap(),
            )
            .unwrap();
        session
            .append_message(
                Message::new("let me help", Sender::Admin, None, None).unwrap(),
            )
            .unwrap();
        assert_eq!(session.total_tokens, 5);
    }

    #[test]
    fn end_sets_end_time_and_clears_active() {
        let mut session = Session::new("s1".into(), "u1".into(), "c1".into());
        assert!(session.end_time.is_none());
        session.end(Utc::now());
        assert!(!session.is_active);
        assert!(session.end_time.is_some());
        assert!(session.current_owner_connection_id.is_none());
    }

    #[test]
    fn resumable_only_when_disconnected_and_within_window() {
        let mut session = Session::new("s1".into(), "u1".into(), "c1".into());
        let window = chrono::Duration::minutes(15);
        assert!(!session.is_resumable(Utc::now(), window));
        session.current_owner_connection_id = None;
        assert!(session.is_resumable(Utc::now(), window));
    }
}
