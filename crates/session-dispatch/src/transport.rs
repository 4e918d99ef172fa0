//! Transport abstraction and the reqwest-backed implementation
//!
//! The dispatcher never talks to the network directly: it hands a fully
//! resolved `TransportRequest` to a `Transport` and classifies what comes back.
//! Timeouts are a transport concern; the dispatcher only sees them as a
//! `TransportError`.

use std::future::Future;
use std::pin::Pin;

use tracing::debug;

use crate::error::TransportError;
use crate::request::{Response, TransportRequest};

/// Boxed future returned by `Transport::execute`.
pub type TransportFuture<'a> =
    Pin<Box<dyn Future<Output = std::result::Result<Response, TransportError>> + Send + 'a>>;

/// Performs a single HTTP call. Stateless from the dispatcher's point of view.
///
/// Uses `Pin<Box<dyn Future>>` return types so the dispatcher can hold an
/// `Arc<dyn Transport>`.
pub trait Transport: Send + Sync {
    fn execute(&self, request: TransportRequest) -> TransportFuture<'_>;
}

/// Transport over a shared `reqwest::Client`.
///
/// The client keeps a cookie jar: the refresh endpoint authenticates with the
/// HTTP-only session cookie set at sign-in, not with the bearer token.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Build a transport with a cookie-carrying client.
    pub fn new() -> std::result::Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .cookie_store(true)
            .build()
            .map_err(|e| TransportError::InvalidRequest(format!("building HTTP client: {e}")))?;
        Ok(Self { client })
    }

    /// Wrap an existing client (its cookie and TLS settings are kept as-is).
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Transport for ReqwestTransport {
    fn execute(&self, request: TransportRequest) -> TransportFuture<'_> {
        Box::pin(async move {
            let mut builder = self
                .client
                .request(request.method, &request.url)
                .headers(request.headers)
                .timeout(request.timeout);
            if let Some(body) = request.body {
                builder = builder.body(body);
            }

            let response = builder.send().await.map_err(classify)?;
            let status = response.status();
            let headers = response.headers().clone();
            let body = response.bytes().await.map_err(classify)?;

            debug!(url = %request.url, status = status.as_u16(), "transport call completed");
            Ok(Response::new(status, headers, body))
        })
    }
}

fn classify(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout(e.to_string())
    } else if e.is_connect() {
        TransportError::Connect(e.to_string())
    } else if e.is_builder() {
        TransportError::InvalidRequest(e.to_string())
    } else {
        TransportError::Other(e.to_string())
    }
}
