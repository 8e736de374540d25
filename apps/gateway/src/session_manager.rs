//! `SessionManager` (§4.2): per-session state and the only component that
//! writes through to the `SessionStore`.
//!
//! Locking discipline (§5): a global `RwLock` over the session map is held
//! only for insert/remove; each session's own fields are guarded by a
//! per-session `tokio::sync::Mutex`. Holding that per-session mutex across
//! a persistence call is allowed because every persistence call in this
//! module carries its own bounded timeout.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};
use std::time::Duration;

use chatgate_core::{ChatGateError, Identity, Message, Session, SessionStore};
use opentelemetry::global;
use opentelemetry::metrics::{Counter, UpDownCounter};
use tokio::sync::Mutex;
use tokio::time::sleep;
use uuid::Uuid;

#[derive(Clone)]
struct SessionMetrics {
    created: Counter<u64>,
    ended: Counter<u64>,
    active: UpDownCounter<i64>,
    takeovers: Counter<u64>,
}

impl SessionMetrics {
    fn shared() -> Self {
        static METRICS: OnceLock<SessionMetrics> = OnceLock::new();
        METRICS
            .get_or_init(|| {
                let meter = global::meter("chatgate_sessions");
                Self {
                    created: meter
                        .u64_counter("chatgate.sessions.created")
                        .with_description("Sessions created via AttachOrResume")
                        .build(),
                    ended: meter
                        .u64_counter("chatgate.sessions.ended")
                        .with_description("Sessions ended")
                        .build(),
                    active: meter
                        .i64_up_down_counter("chatgate.sessions.active")
                        .with_description("Currently active sessions")
                        .build(),
                    takeovers: meter
                        .u64_counter("chatgate.sessions.admin_takeovers")
                        .with_description("Admin takeover requests granted")
                        .build(),
                }
            })
            .clone()
    }
}

/// Result of [`SessionManager::attach_or_resume`].
pub struct Attached {
    pub session: Session,
    pub resumed: bool,
}

struct Entry {
    session: Mutex<Session>,
    /// Connection that owned the session immediately before an admin
    /// takeover, so `ReleaseAdmin` can hand it back without the caller
    /// needing to remember it. Not part of the persisted data model (§3
    /// only defines a single current-owner field).
    pre_admin_owner: Mutex<Option<String>>,
}

/// Owns every live [`Session`] and mediates all mutation of it (§4.2).
pub struct SessionManager {
    sessions: RwLock<HashMap<String, Arc<Entry>>>,
    store: Arc<dyn SessionStore>,
    reconnect_timeout: chrono::Duration,
    session_ttl: chrono::Duration,
    append_retry_base: Duration,
    append_retry_max: Duration,
    append_retry_attempts: u32,
    metrics: SessionMetrics,
}

impl SessionManager {
    #[must_use]
    pub fn new(
        store: Arc<dyn SessionStore>,
        reconnect_timeout: Duration,
        session_ttl: Duration,
    ) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            store,
            reconnect_timeout: chrono::Duration::from_std(reconnect_timeout)
                .unwrap_or(chrono::Duration::minutes(15)),
            session_ttl: chrono::Duration::from_std(session_ttl)
                .unwrap_or(chrono::Duration::hours(24)),
            append_retry_base: Duration::from_millis(100),
            append_retry_max: Duration::from_secs(2),
            append_retry_attempts: 3,
            metrics: SessionMetrics::shared(),
        }
    }

    fn entry_for(&self, session_id: &str) -> Option<Arc<Entry>> {
        #[allow(clippy::unwrap_used)]
        self.sessions.read().unwrap().get(session_id).cloned()
    }

    /// `AttachOrResume(userID, sessionID, connectionID)` (§4.2): resumes an
    /// existing session if `sessionID` is given and resumable, otherwise
    /// starts a fresh one.
    ///
    /// # Errors
    ///
    /// Returns `ChatGateError::Forbidden` if the session belongs to a
    /// different user, or `ChatGateError::PersistenceFailed` if creating a
    /// brand-new session can't be durably recorded.
    pub async fn attach_or_resume(
        &self,
        identity: &Identity,
        session_id: Option<&str>,
        connection_id: Uuid,
    ) -> Result<Attached, ChatGateError> {
        if let Some(id) = session_id {
            if let Some(entry) = self.entry_for(id) {
                let mut session = entry.session.lock().await;
                if session.user_id != identity.user_id {
                    return Err(ChatGateError::Forbidden("session belongs to a different user".into()));
                }
                let now = chrono::Utc::now();
                if session.is_resumable(now, self.reconnect_timeout) {
                    session.current_owner_connection_id = Some(connection_id.to_string());
                    session.last_activity = now;
                    return Ok(Attached { session: session.clone(), resumed: true });
                }
            }
        }

        let new_id = session_id.map_or_else(|| Uuid::new_v4().to_string(), ToString::to_string);
        let session = Session::new(new_id.clone(), identity.user_id.clone(), connection_id.to_string());

        self.store
            .create_session(&session)
            .await
            .map_err(|e| ChatGateError::PersistenceFailed(e.to_string()))?;

        #[allow(clippy::unwrap_used)]
        self.sessions.write().unwrap().insert(
            new_id,
            Arc::new(Entry { session: Mutex::new(session.clone()), pre_admin_owner: Mutex::new(None) }),
        );
        self.metrics.created.add(1, &[]);
        self.metrics.active.add(1, &[]);

        Ok(Attached { session, resumed: false })
    }

    /// Clears ownership without ending the session, so it becomes eligible
    /// for resumption within the reconnect window (§4.3 termination flow).
    pub async fn detach_connection(&self, session_id: &str) {
        if let Some(entry) = self.entry_for(session_id) {
            let mut session = entry.session.lock().await;
            session.current_owner_connection_id = None;
            session.last_activity = chrono::Utc::now();
        }
    }

    /// `AppendMessage(sessionID, message)` (§4.2). Retries a transient
    /// persistence failure up to 3 times with 100ms base / ×2 / 2s-capped
    /// backoff; on exhaustion the in-memory session is left unchanged and
    /// the caller gets `PersistenceFailed`.
    ///
    /// # Errors
    ///
    /// Returns `ChatGateError::NotFound` if the session is unknown,
    /// `ChatGateError::Validation` if the message violates a data-model
    /// invariant, or `ChatGateError::PersistenceFailed` on retry exhaustion.
    pub async fn append_message(&self, session_id: &str, msg: Message) -> Result<Session, ChatGateError> {
        let entry = self
            .entry_for(session_id)
            .ok_or_else(|| ChatGateError::NotFound(format!("session {session_id}")))?;
        let mut session = entry.session.lock().await;

        let mut delay = self.append_retry_base;
        let mut last_err = None;
        for attempt in 0..self.append_retry_attempts {
            match self.store.append_message(session_id, &msg).await {
                Ok(()) => {
                    session
                        .append_message(msg)
                        .map_err(|e| ChatGateError::Validation(e.to_string()))?;
                    return Ok(session.clone());
                },
                Err(e) if e.is_transient() && attempt + 1 < self.append_retry_attempts => {
                    last_err = Some(e);
                    sleep(delay).await;
                    delay = (delay * 2).min(self.append_retry_max);
                },
                Err(e) => return Err(ChatGateError::PersistenceFailed(e.to_string())),
            }
        }
        Err(ChatGateError::PersistenceFailed(
            last_err.map_or_else(|| "retries exhausted".to_string(), |e| e.to_string()),
        ))
    }

    /// `SetModel(sessionID, modelID)` (§4.2, §5): observed by later
    /// `Send`/`Stream` calls only; an in-flight stream keeps using the
    /// model it started with.
    ///
    /// # Errors
    ///
    /// Returns `ChatGateError::NotFound` if the session is unknown.
    pub async fn set_model(&self, session_id: &str, model_id: &str) -> Result<(), ChatGateError> {
        let entry = self
            .entry_for(session_id)
            .ok_or_else(|| ChatGateError::NotFound(format!("session {session_id}")))?;
        let mut session = entry.session.lock().await;
        session.current_model_id = Some(model_id.to_string());
        Ok(())
    }

    /// `RequestAdminTakeover(sessionID, connectionID)` (§4.2).
    ///
    /// # Errors
    ///
    /// Returns `ChatGateError::NotFound` if the session is unknown.
    pub async fn request_admin_takeover(&self, session_id: &str, connection_id: Uuid) -> Result<Session, ChatGateError> {
        let entry = self
            .entry_for(session_id)
            .ok_or_else(|| ChatGateError::NotFound(format!("session {session_id}")))?;
        let mut session = entry.session.lock().await;
        *entry.pre_admin_owner.lock().await = session.current_owner_connection_id.clone();
        session.admin_assisted = true;
        session.current_owner_connection_id = Some(connection_id.to_string());
        self.metrics.takeovers.add(1, &[]);
        Ok(session.clone())
    }

    /// `ReleaseAdmin(sessionID, connectionID)` (§4.2): hands ownership back
    /// to whichever connection owned the session immediately before the
    /// takeover it is undoing.
    ///
    /// # Errors
    ///
    /// Returns `ChatGateError::NotFound` if the session is unknown.
    pub async fn release_admin(&self, session_id: &str) -> Result<Session, ChatGateError> {
        let entry = self
            .entry_for(session_id)
            .ok_or_else(|| ChatGateError::NotFound(format!("session {session_id}")))?;
        let mut session = entry.session.lock().await;
        session.current_owner_connection_id = entry.pre_admin_owner.lock().await.take();
        Ok(session.clone())
    }

    /// `EndSession(sessionID, reason)` (§4.2). Removes the session from
    /// the live map; the persisted record remains for later retrieval.
    ///
    /// # Errors
    ///
    /// Returns `ChatGateError::NotFound` if the session is unknown.
    pub async fn end_session(&self, session_id: &str) -> Result<Session, ChatGateError> {
        let entry = {
            #[allow(clippy::unwrap_used)]
            let mut sessions = self.sessions.write().unwrap();
            sessions.remove(session_id)
        }
        .ok_or_else(|| ChatGateError::NotFound(format!("session {session_id}")))?;

        let mut session = entry.session.lock().await;
        session.end(chrono::Utc::now());
        let _ = self.store.update_session(&session).await;
        self.metrics.ended.add(1, &[]);
        self.metrics.active.add(-1, &[]);
        Ok(session.clone())
    }

    pub async fn get(&self, session_id: &str) -> Option<Session> {
        let entry = self.entry_for(session_id)?;
        Some(entry.session.lock().await.clone())
    }

    /// Sweeper (§4.2): ends sessions that have exceeded the reconnect
    /// window while disconnected, or the absolute idle TTL.
    pub async fn sweep(&self) {
        let expired: Vec<String> = {
            #[allow(clippy::unwrap_used)]
            let sessions = self.sessions.read().unwrap();
            let now = chrono::Utc::now();
            let mut ids = Vec::new();
            for (id, entry) in sessions.iter() {
                if let Ok(session) = entry.session.try_lock() {
                    if session.is_expired(now, self.reconnect_timeout, self.session_ttl) {
                        ids.push(id.clone());
                    }
                }
            }
            ids
        };
        for id in expired {
            let _ = self.end_session(&id).await;
        }
    }

    /// Runs the sweeper on `interval` until `cancel` fires (§4.2).
    pub async fn run_sweeper(self: Arc<Self>, interval: Duration, cancel: tokio_util::sync::CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                () = cancel.cancelled() => return,
                _ = ticker.tick() => self.sweep().await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use chatgate_core::{Page, Pagination, Sender, SessionFilter, SessionSort, StoreError};

    use super::*;

    struct FlakyStore {
        fail_once: AtomicBool,
    }

    #[async_trait]
    impl SessionStore for FlakyStore {
        async fn create_session(&self, _session: &Session) -> Result<(), StoreError> {
            Ok(())
        }
        async fn update_session(&self, _session: &Session) -> Result<(), StoreError> {
            Ok(())
        }
        async fn get_session(&self, _id: &str) -> Result<Option<Session>, StoreError> {
            Ok(None)
        }
        async fn list_user_sessions(
            &self,
            _user_id: &str,
            _filter: &SessionFilter,
            _sort: SessionSort,
            _page: Pagination,
        ) -> Result<Page<Session>, StoreError> {
            Ok(Page { items: vec![], total: 0 })
        }
        async fn append_message(&self, _session_id: &str, _msg: &Message) -> Result<(), StoreError> {
            if self.fail_once.swap(false, Ordering::SeqCst) {
                Err(StoreError::transient("connection reset"))
            } else {
                Ok(())
            }
        }
    }

    fn identity() -> Identity {
        Identity { user_id: "u1".into(), roles: vec![] }
    }

    #[tokio::test]
    async fn attach_creates_a_fresh_session_when_none_given() {
        let manager = SessionManager::new(
            Arc::new(crate::store::MemoryStore::new()),
            Duration::from_secs(900),
            Duration::from_secs(86400),
        );
        let attached = manager.attach_or_resume(&identity(), None, Uuid::new_v4()).await.unwrap();
        assert!(!attached.resumed);
    }

    #[tokio::test]
    async fn resume_rejects_a_different_users_session() {
        let manager = SessionManager::new(
            Arc::new(crate::store::MemoryStore::new()),
            Duration::from_secs(900),
            Duration::from_secs(86400),
        );
        let attached = manager.attach_or_resume(&identity(), None, Uuid::new_v4()).await.unwrap();
        manager.detach_connection(&attached.session.session_id).await;

        let other = Identity { user_id: "u2".into(), roles: vec![] };
        let err = manager
            .attach_or_resume(&other, Some(&attached.session.session_id), Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, ChatGateError::Forbidden(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn append_message_retries_transient_store_error() {
        let store = Arc::new(FlakyStore { fail_once: AtomicBool::new(true) });
        let manager = SessionManager::new(store, Duration::from_secs(900), Duration::from_secs(86400));
        let attached = manager.attach_or_resume(&identity(), None, Uuid::new_v4()).await.unwrap();
        let msg = Message::new("hi", Sender::User, None, None).unwrap();
        let session = manager.append_message(&attached.session.session_id, msg).await.unwrap();
        assert_eq!(session.messages.len(), 1);
    }

    #[tokio::test]
    async fn set_model_is_observed_by_subsequent_reads_only() {
        let manager = SessionManager::new(
            Arc::new(crate::store::MemoryStore::new()),
            Duration::from_secs(900),
            Duration::from_secs(86400),
        );
        let attached = manager.attach_or_resume(&identity(), None, Uuid::new_v4()).await.unwrap();
        manager.set_model(&attached.session.session_id, "m2").await.unwrap();
        let session = manager.get(&attached.session.session_id).await.unwrap();
        assert_eq!(session.current_model_id.as_deref(), Some("m2"));
    }

    #[tokio::test]
    async fn end_session_removes_it_from_the_live_map() {
        let manager = SessionManager::new(
            Arc::new(crate::store::MemoryStore::new()),
            Duration::from_secs(900),
            Duration::from_secs(86400),
        );
        let attached = manager.attach_or_resume(&identity(), None, Uuid::new_v4()).await.unwrap();
        manager.end_session(&attached.session.session_id).await.unwrap();
        assert!(manager.get(&attached.session.session_id).await.is_none());
    }
}
