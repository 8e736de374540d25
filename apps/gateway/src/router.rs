//! `Router` (§4.4): dispatches inbound frames to the right component and
//! drives the LLM streaming pipeline.
//!
//! One [`RouterRequest`] is handled per `tokio::spawn`ed task, so a
//! long-running `user.message` stream never blocks the connection's
//! read-pump from accepting `user.switch_model`/`admin.*` frames in the
//! meantime (§5: concurrent `SetModel` doesn't affect an in-flight stream).

use std::sync::{Arc, OnceLock};
use std::time::Instant;

use chatgate_api::{InboundPayload, Outbound, OutboundPayload};
use chatgate_core::{ChatGateError, Identity, Message, Sender, Session};
use chatgate_llm::{LlmMessage, LlmRole, LlmService};
use futures::StreamExt;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram};
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};
use uuid::Uuid;

use crate::registry::ConnectionRegistry;
use crate::session_manager::SessionManager;

/// Tail-preserving truncation: only the most recent messages are kept in
/// the context handed to the provider. Not specified numerically by the
/// spec; chosen as a reasonable default and recorded in `DESIGN.md`.
const CONTEXT_WINDOW_MESSAGES: usize = 20;

#[derive(Clone)]
struct RouterMetrics {
    first_chunk_latency: Histogram<f64>,
    llm_requests: Counter<u64>,
    llm_errors: Counter<u64>,
}

impl RouterMetrics {
    fn shared() -> Self {
        static METRICS: OnceLock<RouterMetrics> = OnceLock::new();
        METRICS
            .get_or_init(|| {
                let meter = global::meter("chatgate_router");
                Self {
                    first_chunk_latency: meter
                        .f64_histogram("chatgate.message.first_chunk_latency_ms")
                        .with_description("Time to first non-empty streamed chunk")
                        .build(),
                    llm_requests: meter
                        .u64_counter("chatgate.llm.requests")
                        .with_description("LLM stream requests issued")
                        .build(),
                    llm_errors: meter
                        .u64_counter("chatgate.llm.errors")
                        .with_description("LLM stream requests that ended in error")
                        .build(),
                }
            })
            .clone()
    }
}

/// One inbound frame, already unwrapped from its envelope, with the
/// identity/connection context the read-pump observed (§4.3/§4.4).
pub struct RouterRequest {
    pub connection_id: Uuid,
    pub session_id: String,
    pub identity: Identity,
    pub payload: InboundPayload,
    pub correlation_id: Option<String>,
}

pub struct Router {
    registry: Arc<ConnectionRegistry>,
    sessions: Arc<SessionManager>,
    llm: Arc<LlmService>,
    root_cancel: CancellationToken,
    metrics: RouterMetrics,
}

impl Router {
    #[must_use]
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        sessions: Arc<SessionManager>,
        llm: Arc<LlmService>,
        root_cancel: CancellationToken,
    ) -> Self {
        Self { registry, sessions, llm, root_cancel, metrics: RouterMetrics::shared() }
    }

    fn send_to(&self, connection_id: Uuid, frame: Outbound) {
        if let Some(handle) = self.registry.lookup(connection_id) {
            let _ = handle.try_send(frame);
        }
    }

    fn send_to_str(&self, connection_id: &str, frame: Outbound) {
        if let Ok(id) = connection_id.parse::<Uuid>() {
            self.send_to(id, frame);
        }
    }

    fn error_frame(session_id: &str, err: &ChatGateError, correlation_id: Option<String>) -> Outbound {
        Outbound::for_session(
            session_id,
            OutboundPayload::AiError {
                code: err.wire_code().to_string(),
                message: "request could not be completed".to_string(),
                correlation_id,
            },
        )
    }

    /// Dispatches one request derived from an inbound frame (§4.4). Runs to
    /// completion as its own task; `connection_cancel` is the owning
    /// connection's per-connection token (§4.4 point 3: the stream's
    /// cancellation scope derives from both the process root and the
    /// owning connection).
    pub async fn handle(self: Arc<Self>, req: RouterRequest, connection_cancel: CancellationToken) {
        match req.payload {
            InboundPayload::UserMessage { content, model_id } => {
                self.handle_user_message(
                    req.connection_id,
                    &req.session_id,
                    content,
                    model_id,
                    req.correlation_id,
                    connection_cancel,
                )
                .await;
            },
            InboundPayload::UserSwitchModel { model_id } => {
                self.handle_switch_model(req.connection_id, &req.session_id, &model_id).await;
            },
            InboundPayload::AdminTakeover {} => {
                self.handle_admin_takeover(req.connection_id, &req.identity, &req.session_id).await;
            },
            InboundPayload::AdminRelease {} => {
                self.handle_admin_release(req.connection_id, &req.identity, &req.session_id).await;
            },
            InboundPayload::AdminMessage { content } => {
                self.handle_admin_message(req.connection_id, &req.identity, &req.session_id, content).await;
            },
            InboundPayload::SessionEnd {} => {
                self.handle_session_end(req.connection_id, &req.session_id).await;
            },
            InboundPayload::Ping {} => {},
        }
    }

    async fn require_owner(&self, connection_id: Uuid, session_id: &str) -> Result<Session, ChatGateError> {
        let session = self
            .sessions
            .get(session_id)
            .await
            .ok_or_else(|| ChatGateError::NotFound(format!("session {session_id}")))?;
        if session.current_owner_connection_id.as_deref() != Some(&connection_id.to_string()) {
            return Err(ChatGateError::Forbidden("connection does not own this session".into()));
        }
        Ok(session)
    }

    async fn handle_user_message(
        &self,
        connection_id: Uuid,
        session_id: &str,
        content: String,
        requested_model_id: Option<String>,
        correlation_id: Option<String>,
        connection_cancel: CancellationToken,
    ) {
        let session = match self.require_owner(connection_id, session_id).await {
            Ok(s) => s,
            Err(e) => return self.send_to(connection_id, Self::error_frame(session_id, &e, correlation_id)),
        };

        let model_id = match requested_model_id.or_else(|| session.current_model_id.clone()) {
            Some(id) => id,
            None => {
                let err = ChatGateError::Validation("no model selected".into());
                return self.send_to(connection_id, Self::error_frame(session_id, &err, correlation_id));
            },
        };

        if let Err(e) = self.llm.validate(&model_id) {
            let err = ChatGateError::Validation(e.to_string());
            return self.send_to(connection_id, Self::error_frame(session_id, &err, correlation_id));
        }

        let user_msg = match Message::new(content, Sender::User, None, None) {
            Ok(m) => m,
            Err(e) => {
                let err = ChatGateError::Validation(e.to_string());
                return self.send_to(connection_id, Self::error_frame(session_id, &err, correlation_id));
            },
        };

        let session = match self.sessions.append_message(session_id, user_msg).await {
            Ok(s) => s,
            Err(e) => return self.send_to(connection_id, Self::error_frame(session_id, &e, correlation_id)),
        };

        self.stream_reply(session_id, &session, &model_id, correlation_id, connection_cancel).await;
    }

    fn build_context(session: &Session) -> Vec<LlmMessage> {
        let start = session.messages.len().saturating_sub(CONTEXT_WINDOW_MESSAGES);
        session.messages[start..]
            .iter()
            .map(|m| {
                let role = match m.sender {
                    Sender::User => LlmRole::User,
                    // Admin replies stand in for the assistant side of the
                    // conversation from the model's point of view (§9 open
                    // question: admin messages don't count toward
                    // `totalTokens`, but they still belong in context).
                    Sender::Ai | Sender::Admin => LlmRole::Assistant,
                };
                LlmMessage::new(role, m.content.clone())
            })
            .collect()
    }

    async fn stream_reply(
        &self,
        session_id: &str,
        session: &Session,
        model_id: &str,
        correlation_id: Option<String>,
        connection_cancel: CancellationToken,
    ) {
        let request_cancel = derive_request_cancel(&self.root_cancel, &connection_cancel);
        let history = Self::build_context(session);
        let started = Instant::now();
        self.metrics.llm_requests.add(1, &[]);

        let mut chunks = match self.llm.stream(&request_cancel, model_id, &history).await {
            Ok(s) => s,
            Err(e) => {
                self.metrics.llm_errors.add(1, &[]);
                error!(error = %e, model_id, "llm stream establishment failed");
                let err = ChatGateError::UpstreamUnavailable(e.to_string());
                self.send_to_current_owner(session_id, Self::error_frame(session_id, &err, correlation_id)).await;
                return;
            },
        };

        let mut first_chunk_recorded = false;
        let mut response = String::new();

        loop {
            let next = tokio::select! {
                () = request_cancel.cancelled() => None,
                chunk = chunks.next() => chunk,
            };
            let Some(chunk) = next else { break };

            let chunk = match chunk {
                Ok(c) => c,
                Err(e) => {
                    self.metrics.llm_errors.add(1, &[]);
                    error!(error = %e, model_id, "llm stream failed mid-flight");
                    let err = ChatGateError::UpstreamUnavailable(e.to_string());
                    self.send_to_current_owner(session_id, Self::error_frame(session_id, &err, None)).await;
                    return;
                },
            };

            if !chunk.content.is_empty() {
                if !first_chunk_recorded {
                    #[allow(clippy::cast_precision_loss)]
                    self.metrics.first_chunk_latency.record(started.elapsed().as_millis() as f64, &[]);
                    first_chunk_recorded = true;
                }
                response.push_str(&chunk.content);
                let frame = Outbound::for_session(session_id, OutboundPayload::AiDelta { content: chunk.content });
                self.send_to_current_owner(session_id, frame).await;
            }

            if chunk.done {
                let tokens = u32::try_from(self.llm.count_tokens(model_id, &response).unwrap_or(0)).unwrap_or(u32::MAX);
                let duration = started.elapsed();
                let ai_msg = Message::new(response, Sender::Ai, Some(model_id.to_string()), Some(tokens));
                if let Ok(ai_msg) = ai_msg {
                    if let Err(e) = self.sessions.append_message(session_id, ai_msg).await {
                        warn!(error = %e, session_id, "failed to persist completed assistant message");
                    }
                }
                let complete = Outbound::for_session(
                    session_id,
                    OutboundPayload::AiComplete {
                        tokens_used: tokens,
                        duration_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
                    },
                );
                self.send_to_current_owner(session_id, complete).await;
                break;
            }
        }
    }

    /// Re-resolves the session's current owner before every send, so a
    /// mid-stream admin takeover redirects subsequent emissions without the
    /// stream itself being cancelled (§4.4 point 5).
    async fn send_to_current_owner(&self, session_id: &str, frame: Outbound) {
        if let Some(session) = self.sessions.get(session_id).await {
            if let Some(owner) = session.current_owner_connection_id {
                self.send_to_str(&owner, frame);
            }
        }
    }

    async fn handle_switch_model(&self, connection_id: Uuid, session_id: &str, model_id: &str) {
        if self.require_owner(connection_id, session_id).await.is_err() {
            return;
        }
        if let Err(e) = self.llm.validate(model_id) {
            let err = ChatGateError::Validation(e.to_string());
            return self.send_to(connection_id, Self::error_frame(session_id, &err, None));
        }
        if let Err(e) = self.sessions.set_model(session_id, model_id).await {
            self.send_to(connection_id, Self::error_frame(session_id, &e, None));
        }
    }

    async fn handle_admin_takeover(&self, connection_id: Uuid, identity: &Identity, session_id: &str) {
        if !identity.has_admin() {
            let err = ChatGateError::Forbidden("admin role required".into());
            return self.send_to(connection_id, Self::error_frame(session_id, &err, None));
        }
        let session = match self.sessions.request_admin_takeover(session_id, connection_id).await {
            Ok(s) => s,
            Err(e) => return self.send_to(connection_id, Self::error_frame(session_id, &e, None)),
        };
        self.registry.broadcast(&session.user_id, &Outbound::for_session(session_id, OutboundPayload::SessionTakeover {}));
    }

    async fn handle_admin_release(&self, connection_id: Uuid, identity: &Identity, session_id: &str) {
        if !identity.has_admin() {
            let err = ChatGateError::Forbidden("admin role required".into());
            return self.send_to(connection_id, Self::error_frame(session_id, &err, None));
        }
        let session = match self.sessions.release_admin(session_id).await {
            Ok(s) => s,
            Err(e) => return self.send_to(connection_id, Self::error_frame(session_id, &e, None)),
        };
        self.registry.broadcast(&session.user_id, &Outbound::for_session(session_id, OutboundPayload::SessionReleased {}));
    }

    async fn handle_admin_message(&self, connection_id: Uuid, identity: &Identity, session_id: &str, content: String) {
        if !identity.has_admin() {
            let err = ChatGateError::Forbidden("admin role required".into());
            return self.send_to(connection_id, Self::error_frame(session_id, &err, None));
        }
        let msg = match Message::new(content.clone(), Sender::Admin, None, None) {
            Ok(m) => m,
            Err(e) => {
                let err = ChatGateError::Validation(e.to_string());
                return self.send_to(connection_id, Self::error_frame(session_id, &err, None));
            },
        };
        let session = match self.sessions.append_message(session_id, msg).await {
            Ok(s) => s,
            Err(e) => return self.send_to(connection_id, Self::error_frame(session_id, &e, None)),
        };
        // Fan out to every concurrent connection the owning user has open
        // (§9 open question: admin messages broadcast to all of them).
        self.registry.broadcast(&session.user_id, &Outbound::for_session(session_id, OutboundPayload::AdminMessage { content }));
    }

    async fn handle_session_end(&self, connection_id: Uuid, session_id: &str) {
        match self.sessions.end_session(session_id).await {
            Ok(_) => {
                self.send_to(
                    connection_id,
                    Outbound::for_session(session_id, OutboundPayload::SessionEnded { reason: "client".to_string() }),
                );
            },
            Err(e) => self.send_to(connection_id, Self::error_frame(session_id, &e, None)),
        }
    }
}

/// Combines the process-root and owning-connection cancellation scopes
/// into a single token for one request (§4.4 point 3). `CancellationToken`
/// only supports a single-parent `child_token`, so the two independent
/// parents are bridged by a watcher task.
fn derive_request_cancel(root: &CancellationToken, connection: &CancellationToken) -> CancellationToken {
    let combined = CancellationToken::new();
    let watched = combined.clone();
    let root = root.clone();
    let connection = connection.clone();
    tokio::spawn(async move {
        tokio::select! {
            () = root.cancelled() => {},
            () = connection.cancelled() => {},
            () = watched.cancelled() => {},
        }
        watched.cancel();
    });
    combined
}
