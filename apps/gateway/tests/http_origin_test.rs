// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::net::SocketAddr;

use chatgate_gateway::config::Config;
use tokio::net::TcpListener;
use tokio::time::{sleep, Duration};

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

    sleep(Duration::from_millis(50)).await;
    Some((addr, server_handle))
}

#[tokio::test]
async fn origin_guard_blocks_disallowed_origins_on_the_ws_route() {
    let Some((addr, server_handle)) = start_test_server().await else {
        return;
    };

    let url = format!("http://{addr}/chatbox/ws");
    let client = reqwest::Client::new();

    let res = client.get(&url).header("Origin", "https://evil.example").send().await.unwrap();
    assert_eq!(res.status(), reqwest::StatusCode::FORBIDDEN);

    // The default allowlist admits localhost on any port; the origin guard
    // lets it through (it will still 400 — no upgrade headers were sent).
    let res = client.get(&url).header("Origin", "http://localhost:1234").send().await.unwrap();
    assert_ne!(res.status(), reqwest::StatusCode::FORBIDDEN);

    server_handle.abort();
}

#[tokio::test]
async fn health_endpoints_are_reachable_without_an_origin_header() {
    let Some((addr, server_handle)) = start_test_server().await else {
        return;
    };

    let client = reqwest::Client::new();
    let res = client.get(format!("http://{addr}/healthz")).send().await.unwrap();
    assert_eq!(res.status(), reqwest::StatusCode::OK);

    server_handle.abort();
}
