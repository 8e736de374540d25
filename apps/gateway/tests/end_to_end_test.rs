// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::net::SocketAddr;

use chatgate_api::{InboundPayload, Inbound, Outbound, OutboundPayload};
use chatgate_gateway::config::Config;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message as WsMessage;

async fn start_test_server() -> Option<(SocketAddr, tokio::task::JoinHandle<()>)> {
    let listener = match TcpListener::bind("127.0.0.1:0").await {
        Ok(listener) => listener,
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => return None,
        Err(e) => panic!("Failed to bind test server listener: {e}"),
    };
    let addr = listener.local_addr().unwrap();

    let server_handle = tokio::spawn(async move {
        let (app, _state) = chatgate_gateway::server::create_app(Config::default());
        axum::serve(listener, app.into_make_service()).await.unwrap();
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    Some((addr, server_handle))
}

#[tokio::test]
async fn connect_attach_and_end_a_session() {
    let Some((addr, server_handle)) = start_test_server().await else {
        eprintln!("Skipping end-to-end test: local TCP bind not permitted");
        return;
    };

    let ws_url = format!("ws://{addr}/chatbox/ws");
    let mut req = ws_url.into_client_request().unwrap();
    req.headers_mut().insert("x-user-id", "alice".parse().unwrap());

    let (mut ws, _response) =
        timeout(Duration::from_secs(5), tokio_tungstenite::connect_async(req)).await.unwrap().unwrap();

    let attached_msg = timeout(Duration::from_secs(5), ws.next()).await.unwrap().unwrap().unwrap();
    let attached_text = attached_msg.into_text().unwrap();
    let attached: Outbound = serde_json::from_str(&attached_text).unwrap();
    let session_id = match attached.body {
        OutboundPayload::SessionAttached { session_id, resumed, .. } => {
            assert!(!resumed);
            session_id
        },
        other => panic!("expected session.attached, got {other:?}"),
    };

    let end_frame = Inbound::new(InboundPayload::SessionEnd {}, Some(session_id));
    ws.send(WsMessage::Text(serde_json::to_string(&end_frame).unwrap().into())).await.unwrap();

    let ended_msg = timeout(Duration::from_secs(5), ws.next()).await.unwrap().unwrap().unwrap();
    let ended_text = ended_msg.into_text().unwrap();
    let ended: Outbound = serde_json::from_str(ended_text.as_str()).unwrap();
    assert!(matches!(ended.body, OutboundPayload::SessionEnded { .. }));

    server_handle.abort();
}
