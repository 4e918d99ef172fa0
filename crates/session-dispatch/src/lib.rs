//! Authenticated request dispatch with single-flight credential refresh
//!
//! `Dispatcher` attaches the current access token to outbound API calls,
//! notices when the server rejects it, refreshes it once no matter how many
//! requests are waiting, and retries each affected request exactly once.
//!
//! - `Transport`: one HTTP call; `ReqwestTransport` carries the session cookie
//! - `RequestInterceptor`: adds `Authorization: Bearer` outside the allowlist
//! - `RefreshCoordinator`: at most one refresh call outstanding
//! - `ResponseGuard`: accept, retry or reject each attempt

pub mod allowlist;
pub mod config;
pub mod coordinator;
pub mod dispatcher;
pub mod error;
pub mod guard;
pub mod interceptor;
pub mod metrics;
pub mod request;
pub mod transport;

#[cfg(test)]
mod test_support;

pub use allowlist::{Allowlist, DEFAULT_PUBLIC_PATHS};
pub use config::{ApiConfig, SessionConfig};
pub use coordinator::{RefreshCoordinator, RefreshEndpoint, RefreshOutcome, RefreshTicket};
pub use dispatcher::Dispatcher;
pub use error::{Error, RefreshError, Result, TransportError};
pub use guard::{ResponseGuard, Verdict};
pub use interceptor::RequestInterceptor;
pub use request::{Request, Response, TransportRequest};
pub use transport::{ReqwestTransport, Transport, TransportFuture};

pub use credential_store::{AccessToken, CredentialStore};
