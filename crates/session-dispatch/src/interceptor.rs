//! Outgoing request decoration

use credential_store::AccessToken;
use reqwest::header::{AUTHORIZATION, HeaderValue};
use tracing::{trace, warn};

use crate::allowlist::Allowlist;
use crate::request::Request;

/// Attaches `Authorization: Bearer <token>` to requests outside the allowlist.
///
/// The header is built from the credential snapshot passed in; a refresh that
/// completes afterwards does not touch a request already decorated.
#[derive(Debug, Clone)]
pub struct RequestInterceptor {
    allowlist: Allowlist,
}

impl RequestInterceptor {
    pub fn new(allowlist: Allowlist) -> Self {
        Self { allowlist }
    }

    pub fn allowlist(&self) -> &Allowlist {
        &self.allowlist
    }

    /// Decorated copy of `request`.
    ///
    /// Allowlisted requests, and any request sent while no credential is held,
    /// pass through unmodified.
    pub fn decorate(&self, request: &Request, credential: Option<&AccessToken>) -> Request {
        let mut decorated = request.clone();
        if self.allowlist.matches(request.path()) {
            trace!(path = request.route(), "public endpoint, no credential attached");
            return decorated;
        }
        let Some(token) = credential else {
            trace!(path = request.route(), "no credential held");
            return decorated;
        };
        match HeaderValue::from_str(&token.bearer()) {
            Ok(mut value) => {
                value.set_sensitive(true);
                decorated.header_map_mut().insert(AUTHORIZATION, value);
            }
            Err(_) => {
                warn!(
                    path = request.route(),
                    "stored token is not a valid header value, sending without credential"
                );
            }
        }
        decorated
    }
}
