//! Error types for credential persistence

/// Errors from the durable credential backing store.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("credential parse error: {0}")]
    CredentialParse(String),

    #[error("invalid credential path: {0}")]
    InvalidPath(String),
}

/// Result alias for credential store operations.
pub type Result<T> = std::result::Result<T, Error>;
