//! Dispatcher configuration
//!
//! These sections are embedded in the service's TOML file as `[api]` and
//! `[session]`. Every field except `api.base_url` has a default matching the
//! upstream API's auth routes.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use credential_store::{CredentialStore, FileBackend};
use serde::Deserialize;

use crate::allowlist::{Allowlist, DEFAULT_PUBLIC_PATHS, validate_path};
use crate::error::{Error, Result};

/// Upstream API settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// Scheme and authority (plus optional path prefix) every request path is
    /// appended to.
    pub base_url: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

/// Credential and refresh settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub refresh_path: String,
    /// JSON field carrying the access token in refresh and sign-in responses.
    pub token_field: String,
    /// Where the access token is persisted. Memory only when unset.
    pub credential_file: Option<PathBuf>,
    pub public_paths: Vec<String>,
    /// Endpoints whose successful responses hand out a new access token.
    pub capture_paths: Vec<String>,
    pub logout_path: Option<String>,
}

fn default_timeout() -> u64 {
    10
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            refresh_path: "/auth/refresh".into(),
            token_field: "accessToken".into(),
            credential_file: None,
            public_paths: DEFAULT_PUBLIC_PATHS.iter().map(|p| p.to_string()).collect(),
            capture_paths: vec!["/auth/login".into()],
            logout_path: Some("/auth/logout".into()),
        }
    }
}

impl ApiConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            timeout_secs: default_timeout(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.base_url.starts_with("http://") && !self.base_url.starts_with("https://") {
            return Err(Error::Configuration(format!(
                "base_url must start with http:// or https://, got: {}",
                self.base_url
            )));
        }
        if self.timeout_secs == 0 {
            return Err(Error::Configuration(
                "timeout_secs must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Absolute URL for a request path.
    pub fn url_for(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<()> {
        validate_path("refresh_path", &self.refresh_path)?;
        if self.token_field.trim().is_empty() {
            return Err(Error::Configuration("token_field must not be empty".into()));
        }
        for path in &self.capture_paths {
            validate_path("capture path", path)?;
        }
        if let Some(path) = &self.logout_path {
            validate_path("logout_path", path)?;
        }
        self.allowlist().map(drop)
    }

    pub fn allowlist(&self) -> Result<Allowlist> {
        Allowlist::new(self.public_paths.iter().cloned())
    }

    /// Open the credential store this configuration names.
    ///
    /// A store that cannot be created or holds an unreadable credential file
    /// is a configuration error.
    pub fn open_store(&self) -> Result<Arc<CredentialStore>> {
        let store = match &self.credential_file {
            Some(path) => {
                let backend = FileBackend::new(path).map_err(|e| {
                    Error::Configuration(format!("credential_file {}: {e}", path.display()))
                })?;
                CredentialStore::open(backend).map_err(|e| {
                    Error::Configuration(format!("credential_file {}: {e}", path.display()))
                })?
            }
            None => CredentialStore::in_memory(),
        };
        Ok(Arc::new(store))
    }
}
