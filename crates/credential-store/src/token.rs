//! Bearer access token wrapper
//!
//! The token is opaque to the client: there is no expiry metadata, validity is
//! only discovered when the server rejects it. The wrapper keeps the raw value
//! out of logs and wipes it from memory on drop.

use std::fmt;
use zeroize::Zeroize;

/// Opaque bearer token. Redacted in Debug/Display, zeroized on drop.
#[derive(PartialEq, Eq)]
pub struct AccessToken(String);

impl AccessToken {
    /// Wrap a raw token value as-is.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Wrap a token read from an untrusted source (file, response body).
    ///
    /// Surrounding whitespace is trimmed; an empty value yields `None`, since an
    /// empty token is never worth attaching to a request.
    pub fn parse(value: &str) -> Option<Self> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Self(trimmed.to_owned()))
        }
    }

    /// Expose the raw token (use sparingly).
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// `Authorization` header value for this token.
    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.0)
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AccessToken([REDACTED])")
    }
}

impl fmt::Display for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl Clone for AccessToken {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl Drop for AccessToken {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}
