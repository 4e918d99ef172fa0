//! Error taxonomy for dispatched requests
//!
//! Every per-request failure is returned to the caller of `Dispatcher::send`.
//! `TransportError` and `RefreshError` are `Clone` because a single refresh
//! outcome is handed to every request waiting on it.

use crate::request::Response;

/// Network-level failure reported by a `Transport`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("transport failure: {0}")]
    Other(String),
}

impl TransportError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::Timeout(_))
    }

    /// Metric/log label.
    pub fn label(&self) -> &'static str {
        match self {
            TransportError::Timeout(_) => "timeout",
            TransportError::Connect(_) => "connect",
            TransportError::InvalidRequest(_) => "invalid_request",
            TransportError::Other(_) => "other",
        }
    }
}

/// Failure of the shared credential refresh.
///
/// Terminal for every request waiting on that refresh; the session is
/// considered ended and the credential store has been cleared.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RefreshError {
    #[error("refresh endpoint returned {status}")]
    Rejected { status: u16 },

    #[error("refresh request failed: {0}")]
    Transport(TransportError),

    #[error("invalid refresh response: {0}")]
    InvalidResponse(String),

    #[error("refresh ended without an outcome")]
    Abandoned,

    /// The session was ended (logout) while the refresh was in flight; the
    /// refreshed token was discarded.
    #[error("session ended while refreshing")]
    Superseded,
}

impl RefreshError {
    /// Metric/log label.
    pub fn label(&self) -> &'static str {
        match self {
            RefreshError::Rejected { .. } => "rejected",
            RefreshError::Transport(_) => "transport",
            RefreshError::InvalidResponse(_) => "invalid_response",
            RefreshError::Abandoned => "abandoned",
            RefreshError::Superseded => "superseded",
        }
    }
}

/// Errors surfaced by the dispatcher.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The server rejected the credential and the request is not eligible for
    /// (another) refresh-and-retry. Carries the server's response unmodified.
    #[error("authorization rejected for {path} ({})", .response.status)]
    Authorization {
        path: String,
        response: Box<Response>,
    },

    #[error("session refresh failed: {0}")]
    Refresh(#[from] RefreshError),

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl Error {
    /// Metric/log label.
    pub fn label(&self) -> &'static str {
        match self {
            Error::Transport(_) => "transport_error",
            Error::Authorization { .. } => "unauthorized",
            Error::Refresh(_) => "refresh_failed",
            Error::Configuration(_) => "configuration",
        }
    }
}

/// Result alias for dispatcher operations.
pub type Result<T> = std::result::Result<T, Error>;
