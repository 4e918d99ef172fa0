//! Access-token persistence for the session dispatcher
//!
//! Holds the single bearer token an API client presents on authenticated
//! requests, backed by a durable store so a restart does not force a new
//! sign-in. The token is opaque: the client learns it has expired only when
//! the server rejects it.
//!
//! - `AccessToken`: redacted, zeroized token value
//! - `CredentialStore`: get/set/clear over a `CredentialBackend`
//! - `FileBackend` / `MemoryBackend`: durable and ephemeral backends

pub mod backend;
pub mod credentials;
pub mod error;
pub mod token;

pub use backend::{CredentialBackend, FileBackend, MemoryBackend};
pub use credentials::CredentialStore;
pub use error::{Error, Result};
pub use token::AccessToken;
