//! Single-flight credential refresh
//!
//! At most one call to the refresh endpoint is outstanding at any time. The
//! first caller to need a refresh creates a `RefreshTicket` and spawns the
//! refresh task; every other caller finds that ticket in the slot and waits on
//! it. The first caller waits on the very same handle, so there is no
//! difference between the "leader" and the "followers" once the call is
//! issued.
//!
//! The refresh runs on its own task: a caller that gives up (dropped future,
//! cancelled navigation) abandons only its own wait, never the refresh other
//! requests depend on.
//!
//! Outcome ordering on success: store the new token, publish it to all
//! waiters, then empty the slot. On failure: clear the store, publish the
//! error, then empty the slot. The store is written before waiters wake, so a
//! woken request re-decorating from the store sees the new token.
//!
//! Each ticket records the store epoch it started in. If the store is cleared
//! (logout) before the refresh resolves, the new token is discarded and
//! waiters see `RefreshError::Superseded`.
//!
//! Store writes do file I/O under the store's lock and run on the blocking
//! pool.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use credential_store::{AccessToken, CredentialStore};
use reqwest::Method;
use reqwest::header::{ACCEPT, HeaderMap, HeaderValue};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::RefreshError;
use crate::metrics;
use crate::request::TransportRequest;
use crate::transport::Transport;

/// Resolved value of a refresh attempt.
pub type RefreshOutcome = std::result::Result<AccessToken, RefreshError>;

/// Where and how to refresh the access token.
#[derive(Debug, Clone)]
pub struct RefreshEndpoint {
    /// Absolute URL of the refresh endpoint.
    pub url: String,
    /// JSON field of the success body holding the new access token.
    pub token_field: String,
    pub timeout: Duration,
}

/// Shared handle on one refresh attempt.
///
/// Cloning is cheap; every clone observes the same outcome.
#[derive(Clone)]
pub struct RefreshTicket {
    id: u64,
    outcome: watch::Receiver<Option<RefreshOutcome>>,
}

impl RefreshTicket {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_resolved(&self) -> bool {
        self.outcome.borrow().is_some()
    }

    /// Suspend until the refresh resolves.
    pub async fn wait(mut self) -> RefreshOutcome {
        let resolved = self
            .outcome
            .wait_for(Option::is_some)
            .await
            .map_err(|_| RefreshError::Abandoned)?;
        let outcome = (*resolved).clone();
        drop(resolved);
        outcome.unwrap_or(Err(RefreshError::Abandoned))
    }
}

impl std::fmt::Debug for RefreshTicket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshTicket")
            .field("id", &self.id)
            .field("resolved", &self.is_resolved())
            .finish()
    }
}

/// Single-flight coordinator for credential refresh.
#[derive(Clone)]
pub struct RefreshCoordinator {
    inner: Arc<Inner>,
}

struct Inner {
    transport: Arc<dyn Transport>,
    store: Arc<CredentialStore>,
    endpoint: RefreshEndpoint,
    /// The outstanding ticket. Inspected and replaced only under this lock.
    slot: Mutex<Option<RefreshTicket>>,
    next_ticket: AtomicU64,
}

impl RefreshCoordinator {
    pub fn new(
        transport: Arc<dyn Transport>,
        store: Arc<CredentialStore>,
        endpoint: RefreshEndpoint,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                store,
                endpoint,
                slot: Mutex::new(None),
                next_ticket: AtomicU64::new(0),
            }),
        }
    }

    /// Obtain a fresh credential, joining the refresh in flight if there is one.
    pub async fn refresh(&self) -> RefreshOutcome {
        self.ticket().wait().await
    }

    /// Ticket for the outstanding refresh, starting one if none is outstanding.
    ///
    /// Must be called within a tokio runtime.
    pub fn ticket(&self) -> RefreshTicket {
        let mut slot = self.inner.lock_slot();
        if let Some(ticket) = slot.as_ref() {
            debug!(ticket = ticket.id, "joining in-flight refresh");
            return ticket.clone();
        }

        let id = self.inner.next_ticket.fetch_add(1, Ordering::Relaxed) + 1;
        let epoch = self.inner.store.epoch();
        let (tx, rx) = watch::channel(None);
        let ticket = RefreshTicket { id, outcome: rx };
        *slot = Some(ticket.clone());
        drop(slot);

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move { inner.drive(id, epoch, tx).await });
        ticket
    }

    /// Whether a refresh is currently outstanding.
    pub fn is_refreshing(&self) -> bool {
        self.inner.lock_slot().is_some()
    }

    pub fn endpoint(&self) -> &RefreshEndpoint {
        &self.inner.endpoint
    }
}

impl Inner {
    fn lock_slot(&self) -> MutexGuard<'_, Option<RefreshTicket>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run one refresh to completion and publish its outcome.
    async fn drive(&self, id: u64, epoch: u64, tx: watch::Sender<Option<RefreshOutcome>>) {
        // Empties the slot when this task ends, including by panic or runtime
        // shutdown; waiters then see the dropped sender as `Abandoned`.
        let _release = ReleaseSlot { inner: self, id };

        info!(ticket = id, "refreshing access token");
        let started = Instant::now();
        let outcome = match self.call_endpoint().await {
            Ok(token) => self.commit(id, epoch, token).await,
            Err(e) => {
                let store = Arc::clone(&self.store);
                if let Err(join) = tokio::task::spawn_blocking(move || store.clear()).await {
                    warn!(ticket = id, error = %join, "clearing store on blocking pool failed");
                    self.store.clear();
                }
                warn!(ticket = id, error = %e, "refresh failed, session cleared");
                Err(e)
            }
        };

        match &outcome {
            Ok(_) => {
                info!(
                    ticket = id,
                    elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
                    "access token refreshed"
                );
                metrics::record_refresh("success");
            }
            Err(e) => metrics::record_refresh(e.label()),
        }

        // The slot still holds a receiver, so the send cannot fail for lack of one.
        let _ = tx.send(Some(outcome));
    }

    /// Store `token` unless the session ended since the ticket was created.
    async fn commit(&self, id: u64, epoch: u64, token: AccessToken) -> RefreshOutcome {
        let store = Arc::clone(&self.store);
        let stored = token.clone();
        let written = match tokio::task::spawn_blocking(move || store.set_if_epoch(stored, epoch))
            .await
        {
            Ok(written) => written,
            Err(join) => {
                warn!(ticket = id, error = %join, "storing token on blocking pool failed");
                self.store.set_if_epoch(token.clone(), epoch)
            }
        };

        match written {
            None => {
                info!(ticket = id, "session ended during refresh, discarding token");
                Err(RefreshError::Superseded)
            }
            Some(Err(e)) => {
                warn!(ticket = id, error = %e, "refreshed token not persisted, keeping it in memory");
                Ok(token)
            }
            Some(Ok(())) => Ok(token),
        }
    }

    async fn call_endpoint(&self) -> RefreshOutcome {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        let request = TransportRequest {
            method: Method::POST,
            url: self.endpoint.url.clone(),
            headers,
            body: None,
            timeout: self.endpoint.timeout,
        };

        let response = self
            .transport
            .execute(request)
            .await
            .map_err(RefreshError::Transport)?;

        if !response.is_success() {
            return Err(RefreshError::Rejected {
                status: response.status.as_u16(),
            });
        }

        let body: serde_json::Value = response
            .json()
            .map_err(|e| RefreshError::InvalidResponse(format!("body is not JSON: {e}")))?;
        body.get(&self.endpoint.token_field)
            .and_then(serde_json::Value::as_str)
            .and_then(AccessToken::parse)
            .ok_or_else(|| {
                RefreshError::InvalidResponse(format!(
                    "missing or empty `{}` field",
                    self.endpoint.token_field
                ))
            })
    }
}

/// Clears the slot if it still holds ticket `id`.
struct ReleaseSlot<'a> {
    inner: &'a Inner,
    id: u64,
}

impl Drop for ReleaseSlot<'_> {
    fn drop(&mut self) {
        let mut slot = self.inner.lock_slot();
        if slot.as_ref().is_some_and(|t| t.id == self.id) {
            *slot = None;
        }
    }
}
