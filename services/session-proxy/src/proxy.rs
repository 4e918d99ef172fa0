//! HTTP forwarding through the session dispatcher
//!
//! Inbound requests are converted to dispatcher requests, sent with the
//! proxy's own session credential, and the upstream response is returned
//! verbatim. Dispatcher errors become JSON error bodies.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use session_dispatch::{Dispatcher, Error};
use tracing::{error, instrument, warn};

use crate::metrics;

/// Maximum inbound request body.
pub const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Headers to strip in both directions (hop-by-hop per RFC 2616 Section 13.5.1)
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Inbound headers the proxy supplies itself. The credential is attached by
/// the dispatcher, and a caller `cookie` header would stop the client from
/// sending the session cookie from its jar.
const SESSION_MANAGED_HEADERS: &[&str] = &["host", "content-length", "authorization", "cookie"];

/// Shared state passed to the proxy handler via axum State extractor
#[derive(Clone)]
pub struct ProxyState {
    pub dispatcher: Arc<Dispatcher>,
    pub requests_total: Arc<AtomicU64>,
    pub errors_total: Arc<AtomicU64>,
    pub in_flight: Arc<AtomicU64>,
}

/// Counts a request as in flight until dropped.
struct InFlight(Arc<AtomicU64>);

impl InFlight {
    fn enter(counter: &Arc<AtomicU64>) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(Arc::clone(counter))
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// JSON error response: {"error":{"type":"...","message":"...","request_id":"req_..."}}
pub fn error_response(
    status: StatusCode,
    error_type: &str,
    message: &str,
    request_id: &str,
) -> Response {
    let body = serde_json::json!({
        "error": {
            "type": error_type,
            "message": message,
            "request_id": request_id,
        }
    });
    (
        status,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

/// Forward an inbound request through the dispatcher.
#[instrument(skip_all, fields(request_id = %request_id, method = %request.method(), path = %request.uri().path()))]
pub async fn proxy_request(
    state: &ProxyState,
    request: axum::http::Request<axum::body::Body>,
    request_id: String,
) -> Response {
    state.requests_total.fetch_add(1, Ordering::Relaxed);
    let _in_flight = InFlight::enter(&state.in_flight);
    let started = Instant::now();

    let method = request.method().clone();
    let path = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let headers = forwardable_headers(request.headers());

    let body = match axum::body::to_bytes(request.into_body(), MAX_BODY_BYTES).await {
        Ok(b) => b,
        Err(e) => {
            state.errors_total.fetch_add(1, Ordering::Relaxed);
            error!(error = %e, "failed to read request body");
            return error_response(
                StatusCode::BAD_REQUEST,
                "invalid_request",
                &format!("invalid request body: {e}"),
                &request_id,
            );
        }
    };

    let mut outbound = session_dispatch::Request::new(method.clone(), path).headers(headers);
    if !body.is_empty() {
        outbound = outbound.body(body);
    }

    let response = match state.dispatcher.send(outbound).await {
        Ok(upstream) => into_response(upstream, &request_id),
        Err(e) => {
            state.errors_total.fetch_add(1, Ordering::Relaxed);
            error_for(e, &request_id)
        }
    };

    metrics::record_request(
        response.status().as_u16(),
        method.as_str(),
        started.elapsed().as_secs_f64(),
    );
    response
}

/// Map a dispatcher failure to the response the caller sees.
fn error_for(e: Error, request_id: &str) -> Response {
    match e {
        Error::Authorization { path, response } => {
            warn!(path, status = response.status.as_u16(), "upstream rejected credential");
            into_response(*response, request_id)
        }
        Error::Transport(e) if e.is_timeout() => {
            error!(error = %e, "upstream timeout");
            error_response(
                StatusCode::GATEWAY_TIMEOUT,
                "upstream_timeout",
                &e.to_string(),
                request_id,
            )
        }
        Error::Transport(e) => {
            error!(error = %e, "upstream request failed");
            error_response(
                StatusCode::BAD_GATEWAY,
                "upstream_error",
                &e.to_string(),
                request_id,
            )
        }
        Error::Refresh(e) => {
            warn!(error = %e, "session could not be renewed");
            error_response(
                StatusCode::UNAUTHORIZED,
                "session_expired",
                &format!("session expired: {e}"),
                request_id,
            )
        }
        e @ Error::Configuration(_) => {
            error!(error = %e, "proxy misconfigured");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "proxy_error",
                &e.to_string(),
                request_id,
            )
        }
    }
}

/// Rebuild an upstream response for the inbound caller.
fn into_response(upstream: session_dispatch::Response, request_id: &str) -> Response {
    let mut response = Response::builder().status(upstream.status);
    for (name, value) in &upstream.headers {
        if !is_hop_by_hop(name.as_str()) {
            response = response.header(name, value);
        }
    }
    response
        .body(axum::body::Body::from(upstream.body))
        .unwrap_or_else(|e| {
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "proxy_error",
                &format!("response build error: {e}"),
                request_id,
            )
        })
}

fn forwardable_headers(inbound: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in inbound {
        let name_str = name.as_str();
        if !is_hop_by_hop(name_str) && !SESSION_MANAGED_HEADERS.contains(&name_str) {
            headers.append(name.clone(), value.clone());
        }
    }
    headers
}

/// Check if a header is hop-by-hop (should be stripped before forwarding)
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}
