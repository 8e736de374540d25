// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! `WSHandler` (§4.3): the accept flow, read-pump and write-pump for a
//! single WebSocket connection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use chatgate_api::{close_code, Inbound, InboundPayload, ModelInfo as WireModelInfo, Outbound, OutboundPayload};
use opentelemetry::metrics::{Counter, Gauge};
use opentelemetry::{global, KeyValue};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::rate_limiter::MessageDecision;
use crate::registry::OutboundQueue;
use crate::role_extractor::extract_identity;
use crate::router::{Router, RouterRequest};
use crate::state::AppState;

static ACTIVE_CONNECTIONS: AtomicU64 = AtomicU64::new(0);

#[derive(Clone)]
struct WebSocketMetrics {
    connections_gauge: Gauge<u64>,
    messages_counter: Counter<u64>,
    errors_counter: Counter<u64>,
}

impl WebSocketMetrics {
    fn shared() -> Self {
        static METRICS: OnceLock<WebSocketMetrics> = OnceLock::new();
        METRICS
            .get_or_init(|| {
                let meter = global::meter("chatgate_websocket");
                Self {
                    connections_gauge: meter
                        .u64_gauge("chatgate.websocket.connections.active")
                        .with_description("Number of active WebSocket connections")
                        .build(),
                    messages_counter: meter
                        .u64_counter("chatgate.websocket.messages")
                        .with_description("Total WebSocket messages")
                        .build(),
                    errors_counter: meter
                        .u64_counter("chatgate.websocket.errors")
                        .with_description("WebSocket errors")
                        .build(),
                }
            })
            .clone()
    }
}

/// Axum handler for the WebSocket upgrade route.
pub async fn ws_handler(
    State(app_state): State<Arc<AppState>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let identity = match extract_identity(&headers, &app_state.config.server.identity) {
        Ok(identity) => identity,
        Err(e) => {
            warn!(error = %e, "rejecting WebSocket upgrade: no pre-authenticated identity");
            return axum::http::StatusCode::FORBIDDEN.into_response();
        },
    };

    let session_id = headers
        .get("x-session-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    ws.on_upgrade(move |socket| handle_connection(socket, app_state, identity, session_id))
}

/// Accept flow + read-pump + write-pump for one connection (§4.3).
#[allow(clippy::too_many_lines)]
async fn handle_connection(
    mut socket: WebSocket,
    app_state: Arc<AppState>,
    identity: chatgate_core::Identity,
    session_id: Option<String>,
) {
    let metrics = WebSocketMetrics::shared();
    let connection_id = Uuid::new_v4();

    // Step: RateLimiter.AllowConnection — deny beyond the tracked-user cap.
    if !app_state.rate_limiter.allow_connection(&identity.user_id) {
        warn!(user_id = %identity.user_id, "rejecting connection: rate limiter connection cap reached");
        close_with(&mut socket, close_code::POLICY_VIOLATION, "connection limit reached").await;
        return;
    }

    if app_state.registry.lookup_by_user(&identity.user_id).len() >= app_state.config.server.max_connections_per_user {
        warn!(user_id = %identity.user_id, "rejecting connection: per-user connection cap reached");
        app_state.rate_limiter.release_connection(&identity.user_id);
        close_with(&mut socket, close_code::POLICY_VIOLATION, "too many concurrent connections").await;
        return;
    }

    let outbound_queue = OutboundQueue::new(app_state.config.server.send_queue_depth);

    // Step: ConnectionRegistry.Register
    if app_state.registry.register(connection_id, &identity.user_id, Arc::clone(&outbound_queue)).is_err() {
        app_state.rate_limiter.release_connection(&identity.user_id);
        close_with(&mut socket, close_code::INTERNAL_ERROR, "registry unavailable").await;
        return;
    }

    let active = ACTIVE_CONNECTIONS.fetch_add(1, Ordering::Relaxed) + 1;
    metrics.connections_gauge.record(active, &[]);

    // Step: SessionManager.AttachOrResume
    let attached = match app_state.sessions.attach_or_resume(&identity, session_id.as_deref(), connection_id).await {
        Ok(attached) => attached,
        Err(e) => {
            warn!(error = %e, user_id = %identity.user_id, "failed to attach session");
            app_state.registry.unregister(connection_id);
            app_state.rate_limiter.release_connection(&identity.user_id);
            close_with(&mut socket, close_code::POLICY_VIOLATION, "could not attach session").await;
            return;
        },
    };

    info!(
        connection_id = %connection_id,
        user_id = %identity.user_id,
        session_id = %attached.session.session_id,
        resumed = attached.resumed,
        "WebSocket connection established"
    );

    // Step: send session.attached
    let model = attached.session.current_model_id.as_ref().and_then(|id| {
        app_state.llm.list_models().into_iter().find(|m| &m.id == id).map(|m| WireModelInfo { id: m.id, name: m.name })
    });
    let attach_frame = Outbound::for_session(
        attached.session.session_id.clone(),
        OutboundPayload::SessionAttached {
            session_id: attached.session.session_id.clone(),
            resumed: attached.resumed,
            model,
        },
    );
    if socket.send(to_ws_message(&attach_frame)).await.is_err() {
        app_state.registry.unregister(connection_id);
        app_state.sessions.detach_connection(&attached.session.session_id).await;
        app_state.rate_limiter.release_connection(&identity.user_id);
        return;
    }

    let router = Arc::new(Router::new(
        Arc::clone(&app_state.registry),
        Arc::clone(&app_state.sessions),
        Arc::clone(&app_state.llm),
        app_state.shutdown_cancel.clone(),
    ));
    let connection_cancel = CancellationToken::new();
    let session_id = attached.session.session_id.clone();
    let max_frame_bytes = app_state.config.server.max_ws_message_bytes;
    let pong_timeout = Duration::from_secs(app_state.config.server.pong_timeout_secs);
    let mut ping_interval = tokio::time::interval(pong_timeout / 2);
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            biased;

            () = app_state.shutdown_cancel.cancelled() => {
                close_with(&mut socket, close_code::GOING_AWAY, "server shutting down").await;
                break;
            }

            _ = ping_interval.tick() => {
                if awaiting_pong {
                    warn!(connection_id = %connection_id, "closing connection: pong timeout");
                    close_with(&mut socket, close_code::POLICY_VIOLATION, "pong timeout").await;
                    break;
                }
                awaiting_pong = true;
                if socket.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }

            frame = outbound_queue.recv() => {
                metrics.messages_counter.add(1, &[KeyValue::new("direction", "outbound")]);
                if socket.send(to_ws_message(&frame)).await.is_err() {
                    metrics.errors_counter.add(1, &[KeyValue::new("error_type", "send_error")]);
                    break;
                }
            }

            incoming = socket.recv() => {
                let Some(incoming) = incoming else { break };
                match incoming {
                    Ok(WsMessage::Pong(_)) => {
                        awaiting_pong = false;
                    }
                    Ok(WsMessage::Ping(payload)) => {
                        let _ = socket.send(WsMessage::Pong(payload)).await;
                    }
                    Ok(WsMessage::Close(_)) => {
                        info!(connection_id = %connection_id, "client closed the connection");
                        break;
                    }
                    Ok(WsMessage::Text(text)) => {
                        if text.len() > max_frame_bytes {
                            warn!(connection_id = %connection_id, len = text.len(), "message too large");
                            close_with(&mut socket, close_code::MESSAGE_TOO_BIG, "message too large").await;
                            break;
                        }
                        if !handle_inbound_text(
                            &text,
                            connection_id,
                            &session_id,
                            &identity,
                            &app_state,
                            &router,
                            &connection_cancel,
                            &metrics,
                        ) {
                            continue;
                        }
                    }
                    Ok(WsMessage::Binary(data)) => {
                        if data.len() > max_frame_bytes {
                            warn!(connection_id = %connection_id, len = data.len(), "message too large");
                            close_with(&mut socket, close_code::MESSAGE_TOO_BIG, "message too large").await;
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(connection_id = %connection_id, error = %e, "WebSocket error");
                        metrics.errors_counter.add(1, &[KeyValue::new("error_type", "connection_error")]);
                        break;
                    }
                }
            }
        }
    }

    connection_cancel.cancel();
    app_state.registry.unregister(connection_id);
    app_state.sessions.detach_connection(&session_id).await;
    app_state.rate_limiter.release_connection(&identity.user_id);

    let prev = ACTIVE_CONNECTIONS.fetch_sub(1, Ordering::Relaxed);
    metrics.connections_gauge.record(prev.saturating_sub(1), &[]);
    info!(connection_id = %connection_id, "WebSocket connection terminated");
}

/// Parses and routes one inbound text frame. Returns `false` if the frame
/// was rejected (rate-limited or malformed) and no further action is
/// needed from the caller.
#[allow(clippy::too_many_arguments)]
fn handle_inbound_text(
    text: &str,
    connection_id: Uuid,
    session_id: &str,
    identity: &chatgate_core::Identity,
    app_state: &Arc<AppState>,
    router: &Arc<Router>,
    connection_cancel: &CancellationToken,
    metrics: &WebSocketMetrics,
) -> bool {
    metrics.messages_counter.add(1, &[KeyValue::new("direction", "inbound")]);

    let envelope: Inbound = match serde_json::from_str(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(connection_id = %connection_id, error = %e, "failed to parse inbound frame");
            metrics.errors_counter.add(1, &[KeyValue::new("error_type", "parse_error")]);
            return false;
        },
    };

    if matches!(envelope.body, InboundPayload::Ping {}) {
        return true;
    }

    match app_state.rate_limiter.allow_message(&identity.user_id) {
        MessageDecision::Deny { retry_after_ms } => {
            let frame = Outbound::for_session(session_id, OutboundPayload::RateLimited { retry_after_ms });
            if let Some(handle) = app_state.registry.lookup(connection_id) {
                let _ = handle.try_send(frame);
            }
            return false;
        },
        MessageDecision::Allow => {},
    }

    let req = RouterRequest {
        connection_id,
        session_id: session_id.to_string(),
        identity: identity.clone(),
        payload: envelope.body,
        correlation_id: envelope.correlation_id,
    };
    let router = Arc::clone(router);
    let connection_cancel = connection_cancel.clone();
    tokio::spawn(async move { router.handle(req, connection_cancel).await });
    true
}

fn to_ws_message(frame: &Outbound) -> WsMessage {
    #[allow(clippy::unwrap_used)]
    WsMessage::Text(serde_json::to_string(frame).unwrap().into())
}

async fn close_with(socket: &mut WebSocket, code: u16, reason: &'static str) {
    let _ = socket
        .send(WsMessage::Close(Some(CloseFrame { code, reason: reason.into() })))
        .await;
}
