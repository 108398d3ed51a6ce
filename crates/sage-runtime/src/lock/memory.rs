//! In-process lock backend with a lazy idle sweep.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

use sage_settings::LockBackendKind;

use super::{LockBackend, LockError, LockGuard};

struct Entry {
    lock: Arc<tokio::sync::Mutex<()>>,
    last_accessed: Instant,
}

impl Entry {
    /// Nobody holds the mutex and nobody is queued on it: the map owns the only reference.
    fn is_unused(&self) -> bool {
        Arc::strong_count(&self.lock) == 1
    }
}

/// In-process locks keyed by string.
///
/// Unused entries are swept lazily: each `acquire` may run a sweep, at most
/// once per `sweep_interval`, that drops entries idle for longer than
/// `idle_timeout`.
pub struct MemoryLockBackend {
    entries: DashMap<String, Entry>,
    idle_timeout: Duration,
    sweep_interval: Duration,
    last_sweep: Mutex<Instant>,
}

impl MemoryLockBackend {
    /// Create an empty registry.
    pub fn new(idle_timeout: Duration, sweep_interval: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            idle_timeout,
            sweep_interval,
            last_sweep: Mutex::new(Instant::now()),
        }
    }

    /// Number of registered keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no keys are registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn maybe_sweep(&self) {
        let now = Instant::now();
        {
            let mut last = self.last_sweep.lock();
            if now.duration_since(*last) < self.sweep_interval {
                return;
            }
            *last = now;
        }

        let before = self.entries.len();
        self.entries.retain(|_, entry| {
            !(entry.is_unused() && now.duration_since(entry.last_accessed) > self.idle_timeout)
        });
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            debug!(removed, "swept idle locks");
        }
    }

    fn touch(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut entry = self.entries.entry(key.to_owned()).or_insert_with(|| Entry {
            lock: Arc::new(tokio::sync::Mutex::new(())),
            last_accessed: Instant::now(),
        });
        entry.last_accessed = Instant::now();
        entry.lock.clone()
    }
}

#[async_trait]
impl LockBackend for MemoryLockBackend {
    fn kind(&self) -> LockBackendKind {
        LockBackendKind::Memory
    }

    async fn acquire(&self, key: &str) -> Result<LockGuard, LockError> {
        self.maybe_sweep();
        let lock = self.touch(key);
        Ok(LockGuard::Local(lock.lock_owned().await))
    }

    async fn try_acquire(&self, key: &str) -> Result<Option<LockGuard>, LockError> {
        self.maybe_sweep();
        Ok(self.touch(key).try_lock_owned().ok().map(LockGuard::Local))
    }

    async fn release(&self, key: &str, guard: LockGuard) -> Result<(), LockError> {
        drop(guard);
        if let Some(mut entry) = self.entries.get_mut(key) {
            entry.last_accessed = Instant::now();
        }
        Ok(())
    }

    async fn is_locked(&self, key: &str) -> Result<bool, LockError> {
        Ok(self
            .entries
            .get(key)
            .is_some_and(|entry| entry.lock.try_lock().is_err()))
    }

    fn drop_if_unused(&self, key: &str) -> bool {
        self.entries.remove_if(key, |_, entry| entry.is_unused()).is_some()
    }
}
