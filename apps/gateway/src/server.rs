// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use axum::extract::{MatchedPath, State};
use axum::http::{header, HeaderValue, Method};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use opentelemetry::{global, KeyValue};
use tower::ServiceBuilder;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::{DefaultOnFailure, DefaultOnResponse, TraceLayer};
use tracing::{error, info, warn};

use crate::config::{Config, CorsConfig};
use crate::state::AppState;
use crate::websocket;

async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

static HTTP_METRICS: OnceLock<(opentelemetry::metrics::Counter<u64>, opentelemetry::metrics::Histogram<f64>)> =
    OnceLock::new();

async fn metrics_middleware(req: axum::http::Request<axum::body::Body>, next: Next) -> Response {
    let start = Instant::now();
    let method = req.method().clone();
    let path = req
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| req.uri().path().to_owned(), |matched| matched.as_str().to_owned());

    let response = next.run(req).await;

    let latency = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    let (counter, histogram) = HTTP_METRICS
        .get_or_init(|| {
            let meter = global::meter("chatgate_server");
            (meter.u64_counter("http.server.requests").build(), meter.f64_histogram("http.server.duration").build())
        })
        .clone();

    let labels =
        [KeyValue::new("http.method", method.to_string()), KeyValue::new("http.route", path), KeyValue::new("http.status_code", status)];
    counter.add(1, &labels);
    histogram.record(latency, &labels);

    response
}

/// Matches an `Origin` header against a configured pattern. Supports `*`
/// (allow all), exact matches, and `host:*` wildcard-port matches.
fn origin_matches_pattern(origin: &str, pattern: &str) -> bool {
    if pattern == "*" {
        return true;
    }

    if let Some(prefix_without_port) = pattern.strip_suffix(":*") {
        let Some(rest) = origin.strip_prefix(prefix_without_port) else {
            return false;
        };
        let Some(port_str) = rest.strip_prefix(':') else {
            return false;
        };
        return !port_str.is_empty() && port_str.chars().all(|c| c.is_ascii_digit());
    }

    origin == pattern
}

fn create_cors_layer(config: &CorsConfig) -> CorsLayer {
    if config.allowed_origins.iter().any(|o| o == "*") {
        info!("CORS configured to allow all origins (permissive mode)");
        return CorsLayer::permissive();
    }

    if config.allowed_origins.is_empty() {
        info!("CORS configured with no allowed origins (most restrictive)");
        return CorsLayer::new();
    }

    let patterns: Vec<String> = config.allowed_origins.clone();
    info!(allowed_origins = ?patterns, "CORS configured with origin allowlist");

    let allow_origin = AllowOrigin::predicate(move |origin: &HeaderValue, _request_parts| {
        let Ok(origin_str) = origin.to_str() else {
            return false;
        };
        patterns.iter().any(|pattern| origin_matches_pattern(origin_str, pattern))
    });

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any)
        .expose_headers(Any)
}

#[cfg(test)]
mod cors_tests {
    use super::origin_matches_pattern;

    #[test]
    fn cors_wildcard_port_matches_localhost_port_only() {
        assert!(origin_matches_pattern("http://localhost:8080", "http://localhost:*"));
        assert!(origin_matches_pattern("https://localhost:12345", "https://localhost:*"));

        assert!(!origin_matches_pattern("http://localhost", "http://localhost:*"));
        assert!(!origin_matches_pattern("http://localhost:abc", "http://localhost:*"));
        assert!(!origin_matches_pattern("http://localhost123:8080", "http://localhost:*"));
        assert!(!origin_matches_pattern("http://127.0.0.1:8080", "http://localhost:*"));
    }

    #[test]
    fn cors_exact_match_only() {
        assert!(origin_matches_pattern("https://example.com", "https://example.com"));
        assert!(!origin_matches_pattern("https://example.com:443", "https://example.com"));
        assert!(!origin_matches_pattern("https://example.com", "https://example.com:*"));
    }
}

/// Best-effort Origin enforcement for the WebSocket upgrade route. Not
/// authentication — a defense-in-depth measure against cross-site upgrade
/// attempts from a browser context, mirroring the teacher's `/api/`
/// mutating-method guard but scoped to the one route this gateway exposes.
async fn origin_guard_middleware(
    State(app_state): State<Arc<AppState>>,
    req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Response {
    if let Some(origin) = req.headers().get(header::ORIGIN).and_then(|v| v.to_str().ok()) {
        let allowed = app_state.config.server.cors.allowed_origins.iter().any(|p| origin_matches_pattern(origin, p));
        if !allowed {
            warn!(origin = %origin, path = %req.uri().path(), "rejected upgrade: Origin not allowed");
            return (axum::http::StatusCode::FORBIDDEN, "Origin not allowed").into_response();
        }
    }
    next.run(req).await
}

/// Builds the axum application: a health endpoint and the WebSocket
/// upgrade route mounted under `server.path_prefix`.
#[must_use]
pub fn create_app(config: Config) -> (Router, Arc<AppState>) {
    let app_state = Arc::new(AppState::new(config));

    let ws_path = format!("{}/ws", app_state.config.server.path_prefix.trim_end_matches('/'));

    let cors_layer = create_cors_layer(&app_state.config.server.cors);

    let router = Router::new()
        .route("/healthz", get(health_handler))
        .route("/health", get(health_handler))
        .route(&ws_path, get(websocket::ws_handler))
        .with_state(Arc::clone(&app_state))
        .layer(middleware::from_fn_with_state(Arc::clone(&app_state), origin_guard_middleware))
        .layer(ServiceBuilder::new().layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &axum::http::Request<_>| {
                    let route = request
                        .extensions()
                        .get::<MatchedPath>()
                        .map_or_else(|| request.uri().path(), |matched| matched.as_str());
                    tracing::info_span!("http_request", http_method = %request.method(), http_route = %route)
                })
                .on_response(DefaultOnResponse::new().level(tracing::Level::DEBUG))
                .on_failure(DefaultOnFailure::new().level(tracing::Level::WARN)),
        ))
        .layer(middleware::from_fn(metrics_middleware))
        .layer(SetResponseHeaderLayer::if_not_present(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            header::HeaderName::from_static("referrer-policy"),
            HeaderValue::from_static("no-referrer"),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(header::X_FRAME_OPTIONS, HeaderValue::from_static("SAMEORIGIN")))
        .layer(cors_layer);

    (router, app_state)
}

/// Starts the HTTP/WebSocket server and blocks until shutdown completes
/// (§4.8).
///
/// # Errors
///
/// Returns an error if the server address cannot be parsed, TLS is enabled
/// but certificates cannot be loaded, or the listener fails to bind.
///
/// # Panics
///
/// Panics if the Ctrl+C or SIGTERM signal handler cannot be installed
/// (critical OS failure).
pub async fn start_server(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let (app, app_state) = create_app(config.clone());

    let addr: SocketAddr = config.server.address.parse()?;
    if !addr.ip().is_loopback() && config.jwt.secret.is_empty() {
        warn!(
            address = %addr,
            "starting on a non-loopback address with no jwt.secret configured; \
             the `{user_id,roles}` header extractor trusts whatever an upstream proxy forwards \
             unless one is behind it enforcing auth"
        );
    }

    tokio::spawn(Arc::clone(&app_state.sessions).run_sweeper(
        std::time::Duration::from_secs(config.server.sweeper_interval_secs),
        app_state.shutdown_cancel.clone(),
    ));

    #[allow(clippy::expect_used)]
    let shutdown_signal = async {
        let ctrl_c = async {
            tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
        };

        #[cfg(unix)]
        let terminate = async {
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install signal handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            () = ctrl_c => info!("received CTRL-C, initiating graceful shutdown"),
            () = terminate => info!("received SIGTERM, initiating graceful shutdown"),
        }
    };

    let drain_timeout = std::time::Duration::from_secs(config.server.drain_timeout_secs);
    let handle = axum_server::Handle::new();
    tokio::spawn({
        let handle = handle.clone();
        let app_state = Arc::clone(&app_state);
        async move {
            shutdown_signal.await;
            app_state.shutdown_cancel.cancel();
            if let Err(e) = crate::shutdown::ShutdownCoordinator::new(Arc::clone(&app_state)).run(drain_timeout).await {
                warn!(error = %e, "shutdown did not complete within the drain deadline");
            }
            handle.graceful_shutdown(Some(drain_timeout));
        }
    });

    if config.server.tls {
        if config.server.cert_path.is_empty() || config.server.key_path.is_empty() {
            return Err("TLS is enabled but cert_path or key_path is not configured".into());
        }

        info!(address = %addr, "starting HTTPS gateway");
        let tls_config =
            axum_server::tls_rustls::RustlsConfig::from_pem_file(&config.server.cert_path, &config.server.key_path)
                .await
                .map_err(|e| {
                    error!(error = %e, "failed to load TLS certificates");
                    e
                })?;

        axum_server::bind_rustls(addr, tls_config)
            .handle(handle)
            .serve(app.into_make_service())
            .await
            .map_err(|e| {
                error!(error = %e, "gateway server error");
                e.into()
            })
    } else {
        info!(address = %addr, "starting HTTP gateway");
        axum_server::bind(addr).handle(handle).serve(app.into_make_service()).await.map_err(|e| {
            error!(error = %e, "gateway server error");
            e.into()
        })
    }
}
