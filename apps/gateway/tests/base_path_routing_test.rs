// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::net::SocketAddr;

use axum::http::StatusCode;
use chatgate_gateway::config::Config;
use tokio::net::TcpListener;
use tokio::time::{sleep, Duration};

async fn start_test_server_with_path_prefix(
    path_prefix: &str,
) -> Option<(SocketAddr, tokio::task::JoinHandle<()>)> {
    let listener = match TcpListener::bind("127.0.0.1:0").await {
        Ok(listener) => listener,
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => return None,
        Err(e) => panic!("Failed to bind test server listener: {e}"),
    };
    let addr = listener.local_addr().unwrap();

    let mut config = Config::default();
    config.server.path_prefix = path_prefix.to_string();

    let server_handle = tokio::spawn(async move {
        let (app, _state) = chatgate_gateway::server::create_app(config);
        axum::serve(listener, app.into_make_service()).await.unwrap();
    });

    sleep(Duration::from_millis(50)).await;
    Some((addr, server_handle))
}

#[tokio::test]
async fn ws_route_is_mounted_under_the_configured_prefix() {
    let Some((addr, server_handle)) = start_test_server_with_path_prefix("/s/test").await else {
        return;
    };

    let client = reqwest::Client::new();

    // Unprefixed path is not routed.
    let unprefixed = client.get(format!("http://{addr}/ws")).send().await.unwrap();
    assert_eq!(unprefixed.status(), StatusCode::NOT_FOUND);

    // Prefixed path reaches the handler (and is rejected for lacking identity,
    // which still proves the route resolved rather than 404ing).
    let prefixed = client.get(format!("http://{addr}/s/test/ws")).send().await.unwrap();
    assert_ne!(prefixed.status(), StatusCode::NOT_FOUND);

    server_handle.abort();
}

#[tokio::test]
async fn health_endpoints_are_never_under_the_path_prefix() {
    let Some((addr, server_handle)) = start_test_server_with_path_prefix("/s/test").await else {
        return;
    };

    let client = reqwest::Client::new();
    let res = client.get(format!("http://{addr}/healthz")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    server_handle.abort();
}
