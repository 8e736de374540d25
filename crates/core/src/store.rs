//! The `SessionStore` capability (§4.6) — the single external collaborator
//! the core consumes for persistence. The real store (a database, an object
//! store-backed log, whatever the embedder chooses) lives outside this
//! workspace; this module only defines the contract plus the transient/
//! permanent error classification the retry logic in `SessionManager`
//! depends on.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::model::{Message, Session};

/// Whether a [`StoreError`] should be retried by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    Permanent,
}

/// Error returned by a [`SessionStore`] operation.
#[derive(Debug, thiserror::Error)]
#[error("session store error: {message}")]
pub struct StoreError {
    pub message: String,
    pub class: ErrorClass,
}

impl StoreError {
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self { message: message.into(), class: ErrorClass::Transient }
    }

    #[must_use]
    pub fn permanent(message: impl Into<String>) -> Self {
        Self { message: message.into(), class: ErrorClass::Permanent }
    }

    /// Classify an opaque error by sniffing well-known transient substrings,
    /// for stores whose error type doesn't carry a typed classification
    /// (§4.6: "the core sniffs keyword substrings if no typed variant is
    /// available").
    #[must_use]
    pub fn from_display(err: &impl std::fmt::Display) -> Self {
        let text = err.to_string();
        let lower = text.to_ascii_lowercase();
        let class = if ["timeout", "timed out", "connection reset", "connection refused", "temporarily unavailable", "broken pipe"]
            .iter()
            .any(|needle| lower.contains(needle))
        {
            ErrorClass::Transient
        } else {
            ErrorClass::Permanent
        };
        Self { message: text, class }
    }

    #[must_use]
    pub fn is_transient(&self) -> bool {
        self.class == ErrorClass::Transient
    }
}

/// Sort order for [`SessionStore::list_user_sessions`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionSort {
    StartTimeAsc,
    StartTimeDesc,
}

/// Filter predicate for [`SessionStore::list_user_sessions`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionFilter {
    pub active_only: bool,
}

/// Pagination cursor for [`SessionStore::list_user_sessions`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Pagination {
    pub offset: usize,
    pub limit: usize,
}

/// One page of results from [`SessionStore::list_user_sessions`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: usize,
}

/// Persistence contract the core consumes (§4.6). Implementations must be
/// safe for concurrent use — the gateway shares one handle across every
/// session.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create_session(&self, session: &Session) -> Result<(), StoreError>;
    async fn update_session(&self, session: &Session) -> Result<(), StoreError>;
    async fn get_session(&self, id: &str) -> Result<Option<Session>, StoreError>;
    async fn list_user_sessions(
        &self,
        user_id: &str,
        filter: &SessionFilter,
        sort: SessionSort,
        page: Pagination,
    ) -> Result<Page<Session>, StoreError>;
    async fn append_message(&self, session_id: &str, msg: &Message) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_transient_substrings() {
        let e = StoreError::from_display(&"connection reset by peer");
        assert_eq!(e.class, ErrorClass::Transient);
        let e = StoreError::from_display(&"unique constraint violated");
        assert_eq!(e.class, ErrorClass::Permanent);
    }
}
