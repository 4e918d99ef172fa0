//! Session proxy
//!
//! Local sidecar that holds one API session on behalf of its callers:
//! 1. Listens for plain HTTP requests
//! 2. Attaches the session's bearer token to each one
//! 3. Refreshes the token once when the API rejects it, then retries
//! 4. Returns the API's response verbatim

mod config;
mod metrics;
mod proxy;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use metrics_exporter_prometheus::PrometheusHandle;
use session_dispatch::Dispatcher;

use crate::config::Config;
use crate::proxy::ProxyState;

/// How long in-flight requests may run after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    proxy: ProxyState,
    started_at: Instant,
    prometheus: PrometheusHandle,
}

impl AppState {
    fn new(dispatcher: Arc<Dispatcher>, prometheus: PrometheusHandle) -> Self {
        Self {
            proxy: ProxyState {
                dispatcher,
                requests_total: Arc::new(AtomicU64::new(0)),
                errors_total: Arc::new(AtomicU64::new(0)),
                in_flight: Arc::new(AtomicU64::new(0)),
            },
            started_at: Instant::now(),
            prometheus,
        }
    }
}

/// Build the axum router with all routes and shared state.
///
/// `/session` belongs to the proxy; every other path is forwarded.
fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/session", get(session_handler).delete(logout_handler))
        .fallback(proxy_handler)
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    // JSON logs, filtered by LOG_LEVEL then RUST_LOG
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting session-proxy");

    // Install before the dispatcher records anything
    let prometheus_handle =
        metrics::install_recorder().context("failed to install Prometheus recorder")?;

    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        listen_addr = %config.proxy.listen_addr,
        base_url = %config.api.base_url,
        refresh_path = %config.session.refresh_path,
        public_paths = config.session.public_paths.len(),
        persistent = config.session.credential_file.is_some(),
        "configuration loaded"
    );

    let dispatcher = Dispatcher::from_config(&config.api, &config.session)
        .context("failed to initialize session dispatcher")?;
    info!(
        authenticated = dispatcher.is_authenticated(),
        "session dispatcher ready"
    );

    let app_state = AppState::new(Arc::new(dispatcher), prometheus_handle);
    let in_flight = app_state.proxy.in_flight.clone();
    let app = build_router(app_state, config.proxy.max_connections);

    let listen_addr = config.proxy.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    info!(addr = %listen_addr, "accepting requests");

    // The drain timer starts at signal receipt, not at server start.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;
    let _ = shutdown_tx.send(());

    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => {
            info!("all in-flight requests drained");
        }
        Ok(Ok(Err(e))) => {
            error!(error = %e, "server error during shutdown");
        }
        Ok(Err(e)) => {
            error!(error = %e, "server task panicked");
        }
        Err(_) => {
            let remaining = in_flight.load(Ordering::Relaxed);
            warn!(
                remaining,
                drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "drain timeout exceeded, forcing shutdown"
            );
        }
    }

    info!("shutdown complete");
    Ok(())
}

fn json_response(status: axum::http::StatusCode, body: serde_json::Value) -> Response {
    (
        status,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

/// Health endpoint: status, session state, uptime, requests served.
///
/// Always 200 while the process is up; an anonymous session is not a fault.
async fn health_handler(State(state): State<AppState>) -> Response {
    let dispatcher = &state.proxy.dispatcher;
    let session = if dispatcher.is_authenticated() {
        "authenticated"
    } else {
        "anonymous"
    };
    json_response(
        axum::http::StatusCode::OK,
        serde_json::json!({
            "status": "healthy",
            "session": session,
            "refreshing": dispatcher.coordinator().is_refreshing(),
            "uptime_seconds": state.started_at.elapsed().as_secs(),
            "requests_served": state.proxy.requests_total.load(Ordering::Relaxed),
            "errors_total": state.proxy.errors_total.load(Ordering::Relaxed),
        }),
    )
}

/// Prometheus metrics endpoint in text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        axum::http::StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

/// GET /session: whether a credential is held. Never exposes the token.
async fn session_handler(State(state): State<AppState>) -> Response {
    let dispatcher = &state.proxy.dispatcher;
    json_response(
        axum::http::StatusCode::OK,
        serde_json::json!({
            "authenticated": dispatcher.is_authenticated(),
            "refreshing": dispatcher.coordinator().is_refreshing(),
        }),
    )
}

/// DELETE /session: end the session upstream (best-effort) and locally.
async fn logout_handler(State(state): State<AppState>) -> Response {
    state.proxy.dispatcher.logout().await;
    info!("session ended by caller");
    json_response(
        axum::http::StatusCode::OK,
        serde_json::json!({ "authenticated": false }),
    )
}

/// Catch-all handler forwarding every other request upstream.
async fn proxy_handler(
    State(state): State<AppState>,
    request: axum::http::Request<axum::body::Body>,
) -> Response {
    let request_id = format!("req_{}", uuid::Uuid::new_v4().as_simple());
    proxy::proxy_request(&state.proxy, request, request_id).await
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::extract::State as UpstreamState;
    use axum::http::{HeaderMap, Request, StatusCode};
    use axum::routing::post;
    use session_dispatch::{
        AccessToken, ApiConfig, CredentialStore, ReqwestTransport, SessionConfig, Transport,
    };
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;
    use tower::ServiceExt;

    /// Mock API: sign-in sets a refresh cookie, refresh needs that cookie,
    /// everything else echoes the request when the bearer token is current.
    #[derive(Default)]
    struct Upstream {
        valid: Mutex<Option<String>>,
        refresh_calls: AtomicUsize,
    }

    impl Upstream {
        fn set_valid(&self, token: Option<&str>) {
            *self.valid.lock().unwrap() = token.map(str::to_owned);
        }
    }

    fn test_prometheus_handle() -> PrometheusHandle {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .build_recorder()
            .handle()
    }

    async fn start_upstream() -> (String, Arc<Upstream>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let upstream = Arc::new(Upstream::default());

        let app = axum::Router::new()
            .route(
                "/auth/login",
                post(|UpstreamState(up): UpstreamState<Arc<Upstream>>| async move {
                    up.set_valid(Some("T1"));
                    (
                        StatusCode::OK,
                        [("set-cookie", "refreshToken=rt_1; Path=/auth; HttpOnly")],
                        axum::Json(serde_json::json!({ "accessToken": "T1" })),
                    )
                }),
            )
            .route(
                "/auth/refresh",
                post(
                    |UpstreamState(up): UpstreamState<Arc<Upstream>>, headers: HeaderMap| async move {
                        up.refresh_calls.fetch_add(1, Ordering::SeqCst);
                        // Long enough for concurrent rejections to pile up
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        let has_session = headers
                            .get("cookie")
                            .and_then(|v| v.to_str().ok())
                            .is_some_and(|c| c.contains("refreshToken=rt_1"));
                        if has_session {
                            up.set_valid(Some("T2"));
                            (
                                StatusCode::OK,
                                axum::Json(serde_json::json!({ "accessToken": "T2" })),
                            )
                        } else {
                            (
                                StatusCode::UNAUTHORIZED,
                                axum::Json(serde_json::json!({ "message": "no session" })),
                            )
                        }
                    },
                ),
            )
            .route(
                "/auth/logout",
                post(|UpstreamState(up): UpstreamState<Arc<Upstream>>| async move {
                    up.set_valid(None);
                    (
                        StatusCode::OK,
                        [("set-cookie", "refreshToken=; Path=/auth; Max-Age=0")],
                        axum::Json(serde_json::json!({ "ok": true })),
                    )
                }),
            )
            .fallback(
                |UpstreamState(up): UpstreamState<Arc<Upstream>>, request: Request<Body>| async move {
                    let authorization = request
                        .headers()
                        .get("authorization")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("")
                        .to_string();
                    let expected = up
                        .valid
                        .lock()
                        .unwrap()
                        .as_ref()
                        .map(|t| format!("Bearer {t}"));
                    if expected.as_deref() != Some(authorization.as_str()) {
                        return (
                            StatusCode::UNAUTHORIZED,
                            axum::Json(serde_json::json!({ "message": "token expired" })),
                        );
                    }
                    let path = request.uri().path().to_string();
                    let query = request.uri().query().unwrap_or("").to_string();
                    let method = request.method().to_string();
                    let body = axum::body::to_bytes(request.into_body(), 1024 * 1024)
                        .await
                        .unwrap();
                    (
                        StatusCode::OK,
                        axum::Json(serde_json::json!({
                            "authorization": authorization,
                            "method": method,
                            "path": path,
                            "query": query,
                            "body": String::from_utf8_lossy(&body),
                        })),
                    )
                },
            )
            .with_state(upstream.clone());

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (url, upstream)
    }

    fn test_app(base_url: &str, token: Option<&str>) -> (Router, AppState) {
        let store = Arc::new(CredentialStore::in_memory());
        if let Some(token) = token {
            store.set(AccessToken::new(token)).unwrap();
        }
        let transport: Arc<dyn Transport> = Arc::new(ReqwestTransport::new().unwrap());
        let dispatcher = Dispatcher::new(
            &ApiConfig::new(base_url),
            &SessionConfig::default(),
            transport,
            store,
        )
        .unwrap();
        let state = AppState::new(Arc::new(dispatcher), test_prometheus_handle());
        (build_router(state.clone(), 1000), state)
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    fn request(method: &str, uri: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn health_endpoint_reports_session_state() {
        let (app, state) = test_app("http://unused.invalid", Some("T1"));
        state.proxy.requests_total.fetch_add(5, Ordering::Relaxed);

        let response = app.oneshot(request("GET", "/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["session"], "authenticated");
        assert_eq!(json["refreshing"], false);
        assert_eq!(json["requests_served"], 5);
    }

    #[tokio::test]
    async fn metrics_endpoint_returns_prometheus_text() {
        let (app, _) = test_app("http://unused.invalid", None);
        let response = app.oneshot(request("GET", "/metrics")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()["content-type"],
            "text/plain; version=0.0.4; charset=utf-8"
        );
    }

    #[tokio::test]
    async fn sign_in_then_forward_with_bearer() {
        let (url, upstream) = start_upstream().await;
        let (app, _) = test_app(&url, None);

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/auth/login")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"email":"a@b.c","password":"pw"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let session = body_json(app.clone().oneshot(request("GET", "/session")).await.unwrap()).await;
        assert_eq!(session["authenticated"], true);
        assert!(session.get("token").is_none());

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/datasets?page=2")
                    .header("authorization", "Bearer forged")
                    .body(Body::from("payload"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["authorization"], "Bearer T1");
        assert_eq!(json["query"], "page=2");
        assert_eq!(json["body"], "payload");
        assert_eq!(upstream.refresh_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn expired_token_is_refreshed_through_cookie() {
        let (url, upstream) = start_upstream().await;
        let (app, state) = test_app(&url, None);

        app.clone().oneshot(request("POST", "/auth/login")).await.unwrap();
        // The server rotates the session; T1 is no longer accepted.
        upstream.set_valid(Some("T2"));

        let response = app.oneshot(request("GET", "/api/datasets")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["authorization"], "Bearer T2");
        assert_eq!(upstream.refresh_calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            state.proxy.dispatcher.store().get().unwrap().expose(),
            "T2"
        );
    }

    #[tokio::test]
    async fn concurrent_expiry_refreshes_once() {
        let (url, upstream) = start_upstream().await;
        let (app, _) = test_app(&url, None);

        app.clone().oneshot(request("POST", "/auth/login")).await.unwrap();
        upstream.set_valid(Some("T2"));

        let handles: Vec<_> = (0..5)
            .map(|i| {
                let app = app.clone();
                tokio::spawn(async move {
                    app.oneshot(request("GET", &format!("/api/datasets/{i}")))
                        .await
                        .unwrap()
                        .status()
                })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.await.unwrap(), StatusCode::OK);
        }
        assert_eq!(upstream.refresh_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn client_refresh_during_renewal_makes_no_second_call() {
        let (url, upstream) = start_upstream().await;
        let (app, _) = test_app(&url, None);

        app.clone().oneshot(request("POST", "/auth/login")).await.unwrap();
        upstream.set_valid(Some("T2"));

        let forwarded = {
            let app = app.clone();
            tokio::spawn(async move { app.oneshot(request("GET", "/api/datasets")).await.unwrap() })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;

        let response = app.oneshot(request("POST", "/auth/refresh")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["accessToken"], "T2");
        assert_eq!(forwarded.await.unwrap().status(), StatusCode::OK);
        assert_eq!(upstream.refresh_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unrenewable_session_returns_session_expired() {
        let (url, upstream) = start_upstream().await;
        let (app, state) = test_app(&url, Some("stale"));

        let response = app.oneshot(request("GET", "/api/datasets")).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let json = body_json(response).await;
        assert_eq!(json["error"]["type"], "session_expired");
        assert!(
            json["error"]["request_id"]
                .as_str()
                .unwrap()
                .starts_with("req_")
        );
        assert_eq!(upstream.refresh_calls.load(Ordering::SeqCst), 1);
        assert!(!state.proxy.dispatcher.is_authenticated());
        assert_eq!(state.proxy.errors_total.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn public_endpoint_rejection_passes_through() {
        let (url, upstream) = start_upstream().await;
        let (app, _) = test_app(&url, Some("T1"));

        let response = app
            .oneshot(request("POST", "/auth/verify?token=bad"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(response).await["message"], "token expired");
        assert_eq!(upstream.refresh_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unreachable_upstream_is_bad_gateway() {
        let (app, _) = test_app("http://127.0.0.1:1", Some("T1"));
        let response = app.oneshot(request("GET", "/api/datasets")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(body_json(response).await["error"]["type"], "upstream_error");
    }

    #[tokio::test]
    async fn delete_session_logs_out() {
        let (url, upstream) = start_upstream().await;
        let (app, state) = test_app(&url, None);

        app.clone().oneshot(request("POST", "/auth/login")).await.unwrap();
        assert!(state.proxy.dispatcher.is_authenticated());

        let response = app.clone().oneshot(request("DELETE", "/session")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["authenticated"], false);
        assert!(!state.proxy.dispatcher.is_authenticated());
        assert!(upstream.valid.lock().unwrap().is_none());

        let health = body_json(app.oneshot(request("GET", "/health")).await.unwrap()).await;
        assert_eq!(health["session"], "anonymous");
    }
}
