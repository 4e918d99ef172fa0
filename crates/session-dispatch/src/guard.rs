//! Response classification for the refresh-and-retry protocol

use reqwest::StatusCode;
use tracing::debug;

use crate::allowlist::{Allowlist, path_matches};
use crate::error::{Error, TransportError};
use crate::request::{Request, Response};

/// What the dispatcher should do with a completed attempt.
#[derive(Debug)]
pub enum Verdict {
    /// Hand the response to the caller.
    Accept(Response),
    /// The credential was rejected and the request may be retried once after a
    /// refresh.
    RetryNeeded,
    /// Terminal failure.
    Reject(Error),
}

/// Whether `status` means the server rejected the credential.
///
/// Only 401 counts: a 403 is an authenticated "not allowed" and refreshing
/// would not change it.
pub fn is_authorization_failure(status: StatusCode) -> bool {
    status == StatusCode::UNAUTHORIZED
}

/// Decides `Accept`, `RetryNeeded` or `Reject` for each attempt.
#[derive(Debug, Clone)]
pub struct ResponseGuard {
    allowlist: Allowlist,
    refresh_path: String,
}

impl ResponseGuard {
    pub fn new(allowlist: Allowlist, refresh_path: impl Into<String>) -> Self {
        Self {
            allowlist,
            refresh_path: refresh_path.into(),
        }
    }

    pub fn refresh_path(&self) -> &str {
        &self.refresh_path
    }

    /// Classify the outcome of sending `request`.
    ///
    /// The refresh-endpoint and allowlist exemptions are checked separately so
    /// that removing the refresh path from the allowlist never makes the
    /// refresher retryable.
    pub fn inspect(
        &self,
        request: &Request,
        outcome: std::result::Result<Response, TransportError>,
    ) -> Verdict {
        let response = match outcome {
            Ok(response) => response,
            Err(e) => return Verdict::Reject(Error::Transport(e)),
        };

        if !is_authorization_failure(response.status) {
            return Verdict::Accept(response);
        }

        let path = request.route();
        let reason = if request.is_retried() {
            "already retried"
        } else if path_matches(path, &self.refresh_path) {
            "refresh endpoint"
        } else if self.allowlist.matches(path) {
            "public endpoint"
        } else {
            debug!(path, "credential rejected, refresh needed");
            return Verdict::RetryNeeded;
        };

        debug!(path, reason, "credential rejected, not retrying");
        Verdict::Reject(Error::Authorization {
            path: path.to_string(),
            response: Box::new(response),
        })
    }
}
