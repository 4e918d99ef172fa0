//! Authenticated request dispatch
//!
//! `Dispatcher::send` runs each request through the same path:
//!
//! 1. decorate with the current credential (unless the path is public)
//! 2. send through the transport
//! 3. let the `ResponseGuard` decide
//! 4. on `RetryNeeded`, wait for the shared refresh and resend once with the
//!    credential it produced
//!
//! A request for the refresh endpoint itself never reaches the transport
//! directly: it joins the coordinator's refresh, so there is still only one
//! refresh call outstanding, and is answered with the token that refresh
//! produced.
//!
//! A dispatcher is built once per process and shared behind an `Arc`; the
//! credential store and the refresh coordinator are its only shared state.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use credential_store::{AccessToken, CredentialStore};
use reqwest::StatusCode;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderValue};
use tracing::{debug, info, instrument, warn};

use crate::allowlist::path_matches;
use crate::config::{ApiConfig, SessionConfig};
use crate::coordinator::{RefreshCoordinator, RefreshEndpoint};
use crate::error::{Error, Result};
use crate::guard::{ResponseGuard, Verdict};
use crate::interceptor::RequestInterceptor;
use crate::metrics;
use crate::request::{Request, Response, TransportRequest};
use crate::transport::{ReqwestTransport, Transport};

pub struct Dispatcher {
    api: ApiConfig,
    transport: Arc<dyn Transport>,
    store: Arc<CredentialStore>,
    interceptor: RequestInterceptor,
    guard: ResponseGuard,
    coordinator: RefreshCoordinator,
    token_field: String,
    capture_paths: Vec<String>,
    logout_path: Option<String>,
}

impl Dispatcher {
    /// Build a dispatcher over an explicit transport and store.
    pub fn new(
        api: &ApiConfig,
        session: &SessionConfig,
        transport: Arc<dyn Transport>,
        store: Arc<CredentialStore>,
    ) -> Result<Self> {
        api.validate()?;
        session.validate()?;
        let allowlist = session.allowlist()?;

        let coordinator = RefreshCoordinator::new(
            Arc::clone(&transport),
            Arc::clone(&store),
            RefreshEndpoint {
                url: api.url_for(&session.refresh_path),
                token_field: session.token_field.clone(),
                timeout: api.timeout(),
            },
        );

        Ok(Self {
            api: api.clone(),
            transport,
            store,
            interceptor: RequestInterceptor::new(allowlist.clone()),
            guard: ResponseGuard::new(allowlist, session.refresh_path.clone()),
            coordinator,
            token_field: session.token_field.clone(),
            capture_paths: session.capture_paths.clone(),
            logout_path: session.logout_path.clone(),
        })
    }

    /// Build a dispatcher with a cookie-carrying reqwest transport and the
    /// store named by `session`.
    pub fn from_config(api: &ApiConfig, session: &SessionConfig) -> Result<Self> {
        let transport = ReqwestTransport::new()
            .map_err(|e| Error::Configuration(format!("HTTP client: {e}")))?;
        let store = session.open_store()?;
        Self::new(api, session, Arc::new(transport), store)
    }

    /// Send `request`, refreshing the credential and retrying once if the
    /// server rejects it.
    #[instrument(skip_all, fields(method = %request.method(), path = %request.route()))]
    pub async fn send(&self, request: Request) -> Result<Response> {
        let outcome = self.run(request).await;
        match &outcome {
            Ok(response) => {
                debug!(status = response.status.as_u16(), "request completed");
                metrics::record_request("ok");
            }
            Err(e) => {
                debug!(error = %e, "request failed");
                metrics::record_request(e.label());
            }
        }
        outcome
    }

    async fn run(&self, mut request: Request) -> Result<Response> {
        if path_matches(request.path(), self.guard.refresh_path()) {
            return self.refresh_on_behalf().await;
        }

        let mut credential = self.store.get();
        loop {
            let decorated = self.interceptor.decorate(&request, credential.as_ref());
            let outcome = self.transport.execute(self.resolve(decorated)).await;

            match self.guard.inspect(&request, outcome) {
                Verdict::Accept(response) => {
                    self.capture(&request, &response);
                    return Ok(response);
                }
                Verdict::Reject(e) => return Err(e),
                Verdict::RetryNeeded => {
                    let token = self.coordinator.refresh().await?;
                    request.mark_retried();
                    credential = Some(token);
                    metrics::record_retry();
                    debug!("retrying with refreshed credential");
                }
            }
        }
    }

    /// Answer a caller's refresh request from the shared refresh.
    async fn refresh_on_behalf(&self) -> Result<Response> {
        debug!("refresh requested by caller, joining coordinator");
        let token = self.coordinator.refresh().await?;
        let body = serde_json::json!({ self.token_field.as_str(): token.expose() });
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(Response::new(
            StatusCode::OK,
            headers,
            Bytes::from(body.to_string()),
        ))
    }

    /// End the session: tell the server (best-effort) and forget the token.
    ///
    /// The local credential is cleared whatever the server answers.
    pub async fn logout(&self) {
        if let Some(path) = &self.logout_path {
            match self.send(Request::post(path.as_str())).await {
                Ok(response) if response.is_success() => debug!("server session ended"),
                Ok(response) => {
                    warn!(status = response.status.as_u16(), "logout not acknowledged")
                }
                Err(e) => warn!(error = %e, "logout request failed"),
            }
        }
        self.store.clear();
        info!("session cleared");
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.store
    }

    pub fn coordinator(&self) -> &RefreshCoordinator {
        &self.coordinator
    }

    pub fn is_authenticated(&self) -> bool {
        self.store.is_authenticated()
    }

    pub fn base_url(&self) -> &str {
        &self.api.base_url
    }

    fn resolve(&self, request: Request) -> TransportRequest {
        let timeout = request.timeout_override().unwrap_or_else(|| self.default_timeout());
        TransportRequest {
            method: request.method().clone(),
            url: self.api.url_for(request.path()),
            headers: request.header_map().clone(),
            body: request.body_bytes().cloned(),
            timeout,
        }
    }

    fn default_timeout(&self) -> Duration {
        self.api.timeout()
    }

    /// Store the access token handed out by a successful sign-in.
    fn capture(&self, request: &Request, response: &Response) {
        if !response.is_success()
            || !self
                .capture_paths
                .iter()
                .any(|p| path_matches(request.path(), p))
        {
            return;
        }
        let token = response
            .json::<serde_json::Value>()
            .ok()
            .and_then(|body| {
                body.get(&self.token_field)
                    .and_then(serde_json::Value::as_str)
                    .and_then(AccessToken::parse)
            });
        match token {
            Some(token) => {
                if let Err(e) = self.store.set(token) {
                    warn!(error = %e, "captured token not persisted, keeping it in memory");
                }
                info!(path = request.route(), "session credential captured");
            }
            None => debug!(path = request.route(), "no access token in response"),
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("base_url", &self.api.base_url)
            .field("store", &self.store)
            .field("refreshing", &self.coordinator.is_refreshing())
            .finish()
    }
}
