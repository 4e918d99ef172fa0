//! Current-session credential store
//!
//! Holds the one access token the client presents on authenticated requests.
//! The in-memory copy is authoritative for the running process; the backend
//! makes it survive restarts. A single mutex serializes writes so memory and
//! disk never disagree about ordering between a refresh and a logout.
//!
//! Writes hold the mutex across backend I/O, so `set` and `clear` block the
//! calling thread for one small file write or delete. Async callers run them
//! on the blocking pool.
//!
//! Every `clear` starts a new epoch. A writer that read the epoch before
//! starting slow work uses `set_if_epoch` so it cannot resurrect a session
//! that ended in the meantime.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{debug, info, warn};

use crate::backend::{CredentialBackend, MemoryBackend};
use crate::error::Result;
use crate::token::AccessToken;

/// Thread-safe owner of the current access token.
pub struct CredentialStore {
    backend: Box<dyn CredentialBackend>,
    current: Mutex<Option<AccessToken>>,
    /// Bumped by `clear`, only while `current` is locked.
    epoch: AtomicU64,
}

impl CredentialStore {
    /// Open a store over `backend`, loading any token a previous session saved.
    ///
    /// A backend that cannot be read (corrupt file, permissions) is a startup
    /// error: better to refuse to start than to silently drop the session.
    pub fn open(backend: impl CredentialBackend + 'static) -> Result<Self> {
        let current = backend.load()?.as_deref().and_then(AccessToken::parse);
        info!(authenticated = current.is_some(), "credential store opened");
        Ok(Self {
            backend: Box::new(backend),
            current: Mutex::new(current),
            epoch: AtomicU64::new(0),
        })
    }

    /// Store with no durable backing.
    pub fn in_memory() -> Self {
        Self {
            backend: Box::new(MemoryBackend::new()),
            current: Mutex::new(None),
            epoch: AtomicU64::new(0),
        }
    }

    /// Snapshot of the current token.
    pub fn get(&self) -> Option<AccessToken> {
        self.lock().clone()
    }

    /// Whether a token is currently held.
    pub fn is_authenticated(&self) -> bool {
        self.lock().is_some()
    }

    /// Replace the current token and persist it.
    ///
    /// The in-memory token is updated even when persistence fails, so the
    /// running process keeps working; the error tells the caller the token
    /// will not survive a restart.
    pub fn set(&self, token: AccessToken) -> Result<()> {
        let mut current = self.lock();
        Self::write_locked(&*self.backend, &mut current, token)
    }

    /// Current session epoch. Changes every time the store is cleared.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Like `set`, but only if no `clear` happened since `epoch` was read.
    ///
    /// Returns `None` and leaves the store untouched when the epoch is stale.
    pub fn set_if_epoch(&self, token: AccessToken, epoch: u64) -> Option<Result<()>> {
        let mut current = self.lock();
        if self.epoch.load(Ordering::Acquire) != epoch {
            debug!(epoch, "discarding token from an ended session");
            return None;
        }
        Some(Self::write_locked(&*self.backend, &mut current, token))
    }

    fn write_locked(
        backend: &dyn CredentialBackend,
        current: &mut Option<AccessToken>,
        token: AccessToken,
    ) -> Result<()> {
        let persisted = backend.save(token.expose());
        *current = Some(token);
        debug!(persisted = persisted.is_ok(), "stored access token");
        persisted
    }

    /// Forget the current token, in memory and on disk.
    ///
    /// Never fails: a backend that cannot delete is logged, and the in-memory
    /// token is gone regardless.
    pub fn clear(&self) {
        let mut current = self.lock();
        current.take();
        self.epoch.fetch_add(1, Ordering::AcqRel);
        if let Err(e) = self.backend.delete() {
            warn!(error = %e, "failed to delete persisted credential");
        }
        debug!("cleared access token");
    }

    fn lock(&self) -> MutexGuard<'_, Option<AccessToken>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialStore")
            .field("authenticated", &self.is_authenticated())
            .finish()
    }
}
