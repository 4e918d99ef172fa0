//! Unauthenticated-endpoint allowlist
//!
//! Requests whose path falls under one of these prefixes are sent without a
//! credential and are never eligible for refresh-and-retry. Matching is by
//! path segment: `/auth/login` covers `/auth/login` and `/auth/login/otp`
//! but not `/auth/loginx`. A prefix ending in `/` covers everything below it.

use crate::error::{Error, Result};
use crate::request::route_of;

/// Default public endpoints: sign-in, sign-up, refresh, e-mail verification,
/// logout, and the public test endpoints.
pub const DEFAULT_PUBLIC_PATHS: &[&str] = &[
    "/auth/login",
    "/auth/signup",
    "/auth/refresh",
    "/auth/verify",
    "/auth/resend-verification",
    "/auth/logout",
    "/api/tests",
];

/// Ordered, immutable set of public path prefixes.
#[derive(Debug, Clone, Default)]
pub struct Allowlist {
    prefixes: Vec<String>,
}

impl Allowlist {
    /// Build an allowlist, rejecting entries that are not absolute paths.
    pub fn new<I, S>(prefixes: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let prefixes: Vec<String> = prefixes.into_iter().map(Into::into).collect();
        for prefix in &prefixes {
            validate_path("public path", prefix)?;
        }
        Ok(Self { prefixes })
    }

    /// The built-in public endpoints.
    pub fn defaults() -> Self {
        Self {
            prefixes: DEFAULT_PUBLIC_PATHS.iter().map(|p| p.to_string()).collect(),
        }
    }

    /// Whether `path` (query string allowed) falls under any entry.
    pub fn matches(&self, path: &str) -> bool {
        self.prefixes.iter().any(|prefix| path_matches(path, prefix))
    }

    pub fn prefixes(&self) -> &[String] {
        &self.prefixes
    }
}

/// Segment-aware prefix match of a request path against `prefix`.
pub fn path_matches(path: &str, prefix: &str) -> bool {
    let route = route_of(path);
    match route.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/') || prefix.ends_with('/'),
        None => false,
    }
}

/// Configured paths must be absolute and free of query strings.
pub(crate) fn validate_path(what: &str, path: &str) -> Result<()> {
    if !path.starts_with('/') {
        return Err(Error::Configuration(format!(
            "{what} must start with '/', got: {path:?}"
        )));
    }
    if path.contains(['?', '#']) {
        return Err(Error::Configuration(format!(
            "{what} must not contain a query or fragment, got: {path:?}"
        )));
    }
    Ok(())
}
