//! Scripted in-memory API used by coordinator and dispatcher tests.
//!
//! Routes (relative to `BASE_URL`):
//! - `/auth/refresh`: counts calls, sleeps `refresh_delay`, then issues the
//!   scripted token (200 `{"accessToken": ..}`) or 401 when none is scripted
//! - `/auth/login`: 200 with `login_token`, which becomes the valid token
//! - `/auth/signin`: always 401
//! - `/always-401`: always 401, whatever the credential
//! - `/boom`: 500
//! - `/transport-fail`, `/timeout`: transport errors
//! - `/slow`: sleeps, then 200 echoing the Authorization it received
//! - anything else: 200 when `Authorization: Bearer <valid>`, else 401

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use reqwest::StatusCode;
use reqwest::header::{AUTHORIZATION, HeaderMap};

use crate::error::TransportError;
use crate::request::{Response, TransportRequest};
use crate::transport::{Transport, TransportFuture};

pub const BASE_URL: &str = "http://api.test";

pub struct MockApi {
    valid_token: Mutex<Option<String>>,
    refresh_result: Mutex<Option<String>>,
    refresh_body: Mutex<Option<String>>,
    login_token: String,
    refresh_delay: Duration,
    slow_delay: Duration,
    refresh_calls: AtomicUsize,
    calls: Mutex<Vec<TransportRequest>>,
}

impl MockApi {
    /// API accepting `valid` and refreshing to `refreshed` (None → refresh 401).
    pub fn new(valid: Option<&str>, refreshed: Option<&str>) -> Self {
        Self {
            valid_token: Mutex::new(valid.map(str::to_owned)),
            refresh_result: Mutex::new(refreshed.map(str::to_owned)),
            refresh_body: Mutex::new(None),
            login_token: "T_login".into(),
            refresh_delay: Duration::from_millis(50),
            slow_delay: Duration::from_millis(150),
            refresh_calls: AtomicUsize::new(0),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_refresh_delay(mut self, delay: Duration) -> Self {
        self.refresh_delay = delay;
        self
    }

    /// Override the raw 200 body returned by the refresh endpoint.
    pub fn with_refresh_body(self, body: &str) -> Self {
        *self.refresh_body.lock().unwrap() = Some(body.to_owned());
        self
    }

    pub fn set_refresh_result(&self, refreshed: Option<&str>) {
        *self
            .refresh_result
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = refreshed.map(str::to_owned);
    }

    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    /// Recorded calls whose path (after the base URL) starts with `path`.
    pub fn calls_to(&self, path: &str) -> Vec<TransportRequest> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|c| path_of(&c.url).starts_with(path))
            .cloned()
            .collect()
    }

    /// Authorization header value of a recorded call, if any.
    pub fn authorization(call: &TransportRequest) -> Option<String> {
        call.headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned)
    }

    fn is_valid(&self, headers: &HeaderMap) -> bool {
        let valid = self
            .valid_token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match (valid, headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok())) {
            (Some(token), Some(header)) => header == format!("Bearer {token}"),
            _ => false,
        }
    }

    async fn respond(&self, request: TransportRequest) -> Result<Response, TransportError> {
        let path = path_of(&request.url).to_owned();
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.clone());

        match path.as_str() {
            "/auth/refresh" => {
                self.refresh_calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(self.refresh_delay).await;
                let issued = self
                    .refresh_result
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone();
                match issued {
                    Some(token) => {
                        *self
                            .valid_token
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner) = Some(token.clone());
                        let body = self
                            .refresh_body
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .clone()
                            .unwrap_or_else(|| {
                                serde_json::json!({ "accessToken": token }).to_string()
                            });
                        Ok(json(StatusCode::OK, body))
                    }
                    None => Ok(json(
                        StatusCode::UNAUTHORIZED,
                        r#"{"error":"invalid refresh token"}"#.into(),
                    )),
                }
            }
            "/auth/login" => {
                *self
                    .valid_token
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = Some(self.login_token.clone());
                Ok(json(
                    StatusCode::OK,
                    serde_json::json!({ "accessToken": self.login_token }).to_string(),
                ))
            }
            "/auth/signin" | "/always-401" => Ok(json(
                StatusCode::UNAUTHORIZED,
                r#"{"error":"unauthorized"}"#.into(),
            )),
            "/boom" => Ok(json(
                StatusCode::INTERNAL_SERVER_ERROR,
                r#"{"error":"boom"}"#.into(),
            )),
            "/transport-fail" => Err(TransportError::Connect("connection refused".into())),
            "/timeout" => Err(TransportError::Timeout("deadline elapsed".into())),
            "/slow" => {
                let seen = Self::authorization(&request).unwrap_or_default();
                tokio::time::sleep(self.slow_delay).await;
                Ok(json(
                    StatusCode::OK,
                    serde_json::json!({ "authorization": seen }).to_string(),
                ))
            }
            _ => {
                if self.is_valid(&request.headers) {
                    Ok(json(
                        StatusCode::OK,
                        serde_json::json!({ "path": path }).to_string(),
                    ))
                } else {
                    Ok(json(
                        StatusCode::UNAUTHORIZED,
                        r#"{"error":"token expired"}"#.into(),
                    ))
                }
            }
        }
    }
}

impl Transport for MockApi {
    fn execute(&self, request: TransportRequest) -> TransportFuture<'_> {
        Box::pin(self.respond(request))
    }
}

fn path_of(url: &str) -> &str {
    url.strip_prefix(BASE_URL).unwrap_or(url)
}

fn json(status: StatusCode, body: String) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert(
        reqwest::header::CONTENT_TYPE,
        reqwest::header::HeaderValue::from_static("application/json"),
    );
    Response::new(status, headers, Bytes::from(body))
}
