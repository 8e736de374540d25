//! In-memory [`SessionStore`] reference implementation (§4.6, §3
//! "Non-goals: no real persistent store"). Stands in for whatever
//! durable store an embedder would plug in; every session lives only as
//! long as this process does.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chatgate_core::{Message, Page, Pagination, Session, SessionFilter, SessionSort, SessionStore, StoreError};

/// Process-local `HashMap`-backed store, guarded by a single mutex — the
/// same granularity the teacher's in-process state uses for its own
/// session map.
#[derive(Default)]
pub struct MemoryStore {
    sessions: Mutex<HashMap<String, Session>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn create_session(&self, session: &Session) -> Result<(), StoreError> {
        #[allow(clippy::unwrap_used)]
        let mut sessions = self.sessions.lock().unwrap();
        sessions.insert(session.session_id.clone(), session.clone());
        Ok(())
    }

    async fn update_session(&self, session: &Session) -> Result<(), StoreError> {
        #[allow(clippy::unwrap_used)]
        let mut sessions = self.sessions.lock().unwrap();
        sessions.insert(session.session_id.clone(), session.clone());
        Ok(())
    }

    async fn get_session(&self, id: &str) -> Result<Option<Session>, StoreError> {
        #[allow(clippy::unwrap_used)]
        let sessions = self.sessions.lock().unwrap();
        Ok(sessions.get(id).cloned())
    }

    async fn list_user_sessions(
        &self,
        user_id: &str,
        filter: &SessionFilter,
        sort: SessionSort,
        page: Pagination,
    ) -> Result<Page<Session>, StoreError> {
        #[allow(clippy::unwrap_used)]
        let sessions = self.sessions.lock().unwrap();
        let mut matching: Vec<Session> = sessions
            .values()
            .filter(|s| s.user_id == user_id)
            .filter(|s| !filter.active_only || s.is_active)
            .cloned()
            .collect();

        matching.sort_by(|a, b| match sort {
            SessionSort::StartTimeAsc => a.start_time.cmp(&b.start_time),
            SessionSort::StartTimeDesc => b.start_time.cmp(&a.start_time),
        });

        let total = matching.len();
        let items = matching.into_iter().skip(page.offset).take(page.limit).collect();
        Ok(Page { items, total })
    }

    async fn append_message(&self, session_id: &str, msg: &Message) -> Result<(), StoreError> {
        #[allow(clippy::unwrap_used)]
        let mut sessions = self.sessions.lock().unwrap();
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| StoreError::permanent(format!("unknown session {session_id}")))?;
        session
            .append_message(msg.clone())
            .map_err(|e| StoreError::permanent(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use chatgate_core::{Message, Sender};

    use super::*;

    #[tokio::test]
    async fn create_then_get_round_trips() {
        let store = MemoryStore::new();
        let session = Session::new("s1".into(), "u1".into(), "c1".into());
        store.create_session(&session).await.unwrap();
        let fetched = store.get_session("s1").await.unwrap().unwrap();
        assert_eq!(fetched.session_id, "s1");
    }

    #[tokio::test]
    async fn append_message_updates_stored_session() {
        let store = MemoryStore::new();
        let session = Session::new("s1".into(), "u1".into(), "c1".into());
        store.create_session(&session).await.unwrap();
        let msg = Message::new("hi", Sender::User, None, None).unwrap();
        store.append_message("s1", &msg).await.unwrap();
        let fetched = store.get_session("s1").await.unwrap().unwrap();
        assert_eq!(fetched.messages.len(), 1);
    }

    #[tokio::test]
    async fn append_message_to_unknown_session_is_permanent_error() {
        let store = MemoryStore::new();
        let msg = Message::new("hi", Sender::User, None, None).unwrap();
        let err = store.append_message("missing", &msg).await.unwrap_err();
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn list_user_sessions_filters_sorts_and_paginates() {
        let store = MemoryStore::new();
        for i in 0..3 {
            let session = Session::new(format!("s{i}"), "u1".into(), "c1".into());
            store.create_session(&session).await.unwrap();
        }
        let page = store
            .list_user_sessions(
                "u1",
                &SessionFilter::default(),
                SessionSort::StartTimeAsc,
                Pagination { offset: 0, limit: 2 },
            )
            .await
            .unwrap();
        assert_eq!(page.total, 3);
        assert_eq!(page.items.len(), 2);
    }
}
