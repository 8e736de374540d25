//! `ConnectionRegistry` (§4.1): the process-wide map from a connection to
//! its outbound send queue, and from a user to their connections.
//!
//! Locking discipline (§5): one `RwLock` guards the maps; it is never held
//! while enqueueing onto a connection's send queue or while awaiting any
//! external call. `Broadcast` copies out the handles it needs and releases
//! the lock before sending.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex as StdMutex, RwLock};

use chatgate_api::Outbound;
use tokio::sync::Notify;
use tracing::warn;
use uuid::Uuid;

use chatgate_core::ChatGateError;

/// Bounded per-connection outbound queue (§4.3, §5). On overflow, drops the
/// oldest non-control frame to make room for the new one and logs a
/// warning; if every queued frame is itself a control frame (the queue is
/// saturated with session lifecycle/error events), the new frame is
/// dropped instead.
#[derive(Debug)]
pub struct OutboundQueue {
    state: StdMutex<VecDeque<Outbound>>,
    capacity: usize,
    notify: Notify,
}

impl OutboundQueue {
    #[must_use]
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            state: StdMutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            notify: Notify::new(),
        })
    }

    /// Best-effort enqueue; never blocks.
    pub fn push(&self, frame: Outbound) -> bool {
        #[allow(clippy::unwrap_used)]
        let mut queue = self.state.lock().unwrap();
        if queue.len() >= self.capacity {
            if let Some(pos) = queue.iter().position(|f| !f.body.is_control()) {
                queue.remove(pos);
                warn!(capacity = self.capacity, "outbound queue full, dropped oldest non-control frame");
            } else {
                warn!(capacity = self.capacity, "outbound queue full of control frames, dropping new frame");
                return false;
            }
        }
        queue.push_back(frame);
        drop(queue);
        self.notify.notify_one();
        true
    }

    /// Awaits and pops the next queued frame. The write-pump's sole
    /// consumer.
    pub async fn recv(&self) -> Outbound {
        loop {
            {
                #[allow(clippy::unwrap_used)]
                let mut queue = self.state.lock().unwrap();
                if let Some(frame) = queue.pop_front() {
                    return frame;
                }
            }
            self.notify.notified().await;
        }
    }
}

/// A registered connection's outbound half: a bounded queue the write-pump
/// drains, plus the user it belongs to.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub connection_id: Uuid,
    pub user_id: String,
    queue: Arc<OutboundQueue>,
}

impl ConnectionHandle {
    /// Best-effort enqueue; overflow handling lives in `OutboundQueue`
    /// (§4.3).
    pub fn try_send(&self, frame: Outbound) -> bool {
        self.queue.push(frame)
    }
}

struct Inner {
    connections: HashMap<Uuid, ConnectionHandle>,
    by_user: HashMap<String, Vec<Uuid>>,
}

/// Registers active WebSocket connections and routes server-to-client
/// frames to them (§4.1).
pub struct ConnectionRegistry {
    inner: RwLock<Inner>,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self { inner: RwLock::new(Inner { connections: HashMap::new(), by_user: HashMap::new() }) }
    }

    /// `Register(connectionID, userID, sendQueue)` (§4.1).
    ///
    /// # Errors
    ///
    /// Returns `ChatGateError::Internal` if the registry's lock is
    /// poisoned.
    pub fn register(
        &self,
        connection_id: Uuid,
        user_id: &str,
        queue: Arc<OutboundQueue>,
    ) -> Result<ConnectionHandle, ChatGateError> {
        let handle = ConnectionHandle { connection_id, user_id: user_id.to_string(), queue };
        let mut inner =
            self.inner.write().map_err(|_| ChatGateError::Internal("registry lock poisoned".into()))?;
        inner.connections.insert(connection_id, handle.clone());
        inner.by_user.entry(user_id.to_string()).or_default().push(connection_id);
        Ok(handle)
    }

    /// `Unregister(connectionID)` (§4.1). Idempotent: unregistering an
    /// already-absent connection is a no-op.
    pub fn unregister(&self, connection_id: Uuid) {
        #[allow(clippy::unwrap_used)]
        let mut inner = self.inner.write().unwrap();
        if let Some(handle) = inner.connections.remove(&connection_id) {
            if let Some(ids) = inner.by_user.get_mut(&handle.user_id) {
                ids.retain(|id| *id != connection_id);
                if ids.is_empty() {
                    inner.by_user.remove(&handle.user_id);
                }
            }
        }
    }

    /// `LookupByUser(userID)` (§4.1).
    #[must_use]
    pub fn lookup_by_user(&self, user_id: &str) -> Vec<ConnectionHandle> {
        #[allow(clippy::unwrap_used)]
        let inner = self.inner.read().unwrap();
        inner
            .by_user
            .get(user_id)
            .into_iter()
            .flatten()
            .filter_map(|id| inner.connections.get(id).cloned())
            .collect()
    }

    #[must_use]
    pub fn lookup(&self, connection_id: Uuid) -> Option<ConnectionHandle> {
        #[allow(clippy::unwrap_used)]
        self.inner.read().unwrap().connections.get(&connection_id).cloned()
    }

    /// `Broadcast(userID, frame)` (§4.1): best-effort fan-out to every
    /// connection a user currently owns. The registry lock is released
    /// before any send is attempted.
    pub fn broadcast(&self, user_id: &str, frame: &Outbound) {
        let handles = self.lookup_by_user(user_id);
        for handle in handles {
            let _ = handle.try_send(frame.clone());
        }
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        #[allow(clippy::unwrap_used)]
        self.inner.read().unwrap().connections.len()
    }
}

#[cfg(test)]
mod tests {
    use chatgate_api::OutboundPayload;

    use super::*;

    fn frame() -> Outbound {
        chatgate_api::Outbound::for_session("s1", OutboundPayload::SessionTakeover {})
    }

    #[tokio::test]
    async fn register_then_unregister_balances_out() {
        let registry = ConnectionRegistry::new();
        let queue = OutboundQueue::new(8);
        let id = Uuid::new_v4();
        registry.register(id, "u1", queue).unwrap();
        assert_eq!(registry.connection_count(), 1);
        registry.unregister(id);
        assert_eq!(registry.connection_count(), 0);
        registry.unregister(id);
        assert_eq!(registry.connection_count(), 0);
    }

    #[tokio::test]
    async fn broadcast_reaches_every_connection_for_a_user() {
        let registry = ConnectionRegistry::new();
        let queue1 = OutboundQueue::new(8);
        let queue2 = OutboundQueue::new(8);
        registry.register(Uuid::new_v4(), "u1", Arc::clone(&queue1)).unwrap();
        registry.register(Uuid::new_v4(), "u1", Arc::clone(&queue2)).unwrap();

        registry.broadcast("u1", &frame());

        assert_eq!(queue1.recv().await.body, OutboundPayload::SessionTakeover {});
        assert_eq!(queue2.recv().await.body, OutboundPayload::SessionTakeover {});
    }

    #[tokio::test]
    async fn lookup_by_user_is_empty_for_unknown_user() {
        let registry = ConnectionRegistry::new();
        assert!(registry.lookup_by_user("nobody").is_empty());
    }

    #[tokio::test]
    async fn overflow_drops_oldest_non_control_frame() {
        let queue = OutboundQueue::new(2);
        assert!(queue.push(Outbound::for_session("s1", OutboundPayload::AiDelta { content: "a".into() })));
        assert!(queue.push(Outbound::for_session("s1", OutboundPayload::AiDelta { content: "b".into() })));
        assert!(queue.push(Outbound::for_session("s1", OutboundPayload::AiDelta { content: "c".into() })));

        let first = queue.recv().await;
        assert_eq!(first.body, OutboundPayload::AiDelta { content: "b".into() });
        let second = queue.recv().await;
        assert_eq!(second.body, OutboundPayload::AiDelta { content: "c".into() });
    }

    #[tokio::test]
    async fn overflow_never_evicts_control_frames() {
        let queue = OutboundQueue::new(1);
        assert!(queue.push(Outbound::for_session("s1", OutboundPayload::SessionTakeover {})));
        assert!(!queue.push(Outbound::for_session("s1", OutboundPayload::SessionReleased {})));

        let only = queue.recv().await;
        assert_eq!(only.body, OutboundPayload::SessionTakeover {});
    }
}
