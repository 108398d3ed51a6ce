//! Per-session mutual exclusion.
//!
//! [`LockManager`] hides which backend is in use: the in-memory backend for a
//! single process, or the lease backend for processes that share a database.
//! A held key fails fast with [`LockError::Conflict`] unless the caller says
//! the previous run is winding down, in which case it waits up to the
//! configured timeout.

mod lease;
mod memory;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::OwnedMutexGuard;
use tokio_util::sync::DropGuard;
use tracing::{debug, instrument, warn};

use sage_settings::{LockBackendKind, LockSettings};
use sage_store::Database;

pub use lease::LeaseLockBackend;
pub use memory::MemoryLockBackend;

/// Lock failures.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// The key is held by an active run.
    #[error("session {key} is locked by an active run")]
    Conflict {
        /// Lock key.
        key: String,
    },
    /// The key did not become free in time.
    #[error("timed out after {waited:?} waiting for lock {key}")]
    Timeout {
        /// Lock key.
        key: String,
        /// How long the caller waited.
        waited: Duration,
    },
    /// The backend itself failed.
    #[error("lock backend error: {0}")]
    Backend(String),
}

impl LockError {
    /// Contention is retryable; backend failures are not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict { .. } | Self::Timeout { .. })
    }

    /// Error category string.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Conflict { .. } => "conflict",
            Self::Timeout { .. } => "timeout",
            Self::Backend(_) => "persistence",
        }
    }
}

impl From<sage_store::StoreError> for LockError {
    fn from(e: sage_store::StoreError) -> Self {
        Self::Backend(e.to_string())
    }
}

/// What keeps a lock held.
pub enum LockGuard {
    /// Held in-process mutex.
    Local(OwnedMutexGuard<()>),
    /// Held lease; dropping the guard stops renewal.
    Lease {
        /// Lease owner token.
        owner: String,
        /// Stops the renewal task.
        renewal: DropGuard,
    },
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local(_) => f.write_str("Local"),
            Self::Lease { owner, .. } => f.debug_struct("Lease").field("owner", owner).finish(),
        }
    }
}

/// A held lock. Release it through [`LockManager::release`]; dropping it
/// frees a local lock immediately and lets a lease expire.
#[derive(Debug)]
pub struct LockHandle {
    key: String,
    backend: LockBackendKind,
    guard: LockGuard,
}

impl LockHandle {
    /// Lock key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Backend that issued the handle.
    pub fn backend(&self) -> LockBackendKind {
        self.backend
    }
}

/// Storage for locks.
#[async_trait]
pub trait LockBackend: Send + Sync {
    /// Which backend this is.
    fn kind(&self) -> LockBackendKind;

    /// Wait until `key` is acquired. Callers bound the wait.
    async fn acquire(&self, key: &str) -> Result<LockGuard, LockError>;

    /// Take `key` only if it is free right now.
    async fn try_acquire(&self, key: &str) -> Result<Option<LockGuard>, LockError>;

    /// Give up a held lock.
    async fn release(&self, key: &str, guard: LockGuard) -> Result<(), LockError>;

    /// Whether someone holds `key` right now.
    async fn is_locked(&self, key: &str) -> Result<bool, LockError>;

    /// Forget `key` if nobody holds or waits for it. Returns whether anything was removed.
    fn drop_if_unused(&self, key: &str) -> bool;
}

/// Backend-agnostic session lock registry.
#[derive(Clone)]
pub struct LockManager {
    backend: Arc<dyn LockBackend>,
    acquire_timeout: Duration,
}

impl LockManager {
    /// Wrap a backend.
    pub fn new(backend: Arc<dyn LockBackend>, acquire_timeout: Duration) -> Self {
        Self {
            backend,
            acquire_timeout,
        }
    }

    /// In-memory locks with the given settings.
    pub fn memory(settings: &LockSettings) -> Self {
        let backend = MemoryLockBackend::new(
            Duration::from_secs(settings.idle_secs),
            Duration::from_secs(settings.sweep_interval_secs),
        );
        Self::new(Arc::new(backend), Duration::from_secs(settings.acquire_timeout_secs))
    }

    /// Backend chosen by `settings.backend`. The lease backend needs `db`.
    pub fn from_settings(settings: &LockSettings, db: Option<Database>) -> Result<Self, LockError> {
        match settings.backend {
            LockBackendKind::Memory => Ok(Self::memory(settings)),
            LockBackendKind::Lease => {
                let db = db.ok_or_else(|| {
                    LockError::Backend("lease lock backend requires a database".into())
                })?;
                let backend = LeaseLockBackend::new(
                    db,
                    Duration::from_secs(settings.lease_secs),
                    Duration::from_millis(settings.poll_interval_ms),
                );
                Ok(Self::new(
                    Arc::new(backend),
                    Duration::from_secs(settings.acquire_timeout_secs),
                ))
            }
        }
    }

    /// Backend in use.
    pub fn kind(&self) -> LockBackendKind {
        self.backend.kind()
    }

    /// Default wait used by [`LockManager::acquire_default`].
    pub fn acquire_timeout(&self) -> Duration {
        self.acquire_timeout
    }

    /// Acquire `key`.
    ///
    /// A held key is an immediate conflict unless `winding_down` is set (the
    /// owning session is `Interrupted`); then the call waits up to `timeout`.
    #[instrument(skip(self), fields(backend = ?self.backend.kind()))]
    pub async fn acquire(
        &self,
        key: &str,
        timeout: Duration,
        winding_down: bool,
    ) -> Result<LockHandle, LockError> {
        let guard = if winding_down {
            tokio::time::timeout(timeout, self.backend.acquire(key))
                .await
                .map_err(|_| {
                    warn!(key, ?timeout, "lock wait timed out");
                    LockError::Timeout {
                        key: key.to_owned(),
                        waited: timeout,
                    }
                })??
        } else {
            let Some(guard) = self.backend.try_acquire(key).await? else {
                warn!(key, "lock conflict");
                return Err(LockError::Conflict { key: key.to_owned() });
            };
            guard
        };

        debug!(key, "lock acquired");
        Ok(LockHandle {
            key: key.to_owned(),
            backend: self.backend.kind(),
            guard,
        })
    }

    /// [`LockManager::acquire`] with the configured timeout.
    pub async fn acquire_default(&self, key: &str, winding_down: bool) -> Result<LockHandle, LockError> {
        self.acquire(key, self.acquire_timeout, winding_down).await
    }

    /// Release a held lock.
    #[instrument(skip_all, fields(key = %handle.key))]
    pub async fn release(&self, handle: LockHandle) -> Result<(), LockError> {
        let LockHandle { key, guard, .. } = handle;
        self.backend.release(&key, guard).await?;
        debug!(key, "lock released");
        Ok(())
    }

    /// Whether `key` is held.
    pub async fn is_locked(&self, key: &str) -> Result<bool, LockError> {
        self.backend.is_locked(key).await
    }

    /// Forget `key` if unused.
    pub fn drop_if_unused(&self, key: &str) -> bool {
        self.backend.drop_if_unused(key)
    }
}
