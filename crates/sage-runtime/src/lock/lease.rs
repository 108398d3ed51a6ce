//! Database-backed lock backend built on renewable leases.

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use sage_settings::LockBackendKind;
use sage_store::{Database, LeaseRepo};

use super::{LockBackend, LockError, LockGuard};

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn duration_ms(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

/// Locks stored as expiring leases in the shared database.
///
/// A held lease is renewed every third of its length until released, so a
/// live holder keeps it and a crashed holder loses it after one lease period.
pub struct LeaseLockBackend {
    repo: LeaseRepo,
    instance: String,
    lease: Duration,
    poll_interval: Duration,
}

impl LeaseLockBackend {
    /// Create a backend over `db`.
    pub fn new(db: Database, lease: Duration, poll_interval: Duration) -> Self {
        Self {
            repo: LeaseRepo::new(db),
            instance: Uuid::now_v7().to_string(),
            lease,
            poll_interval: poll_interval.max(Duration::from_millis(1)),
        }
    }

    /// One claim attempt under a fresh owner token.
    fn claim(&self, key: &str) -> Result<Option<LockGuard>, LockError> {
        let owner = format!("{}:{}", self.instance, Uuid::now_v7());
        if !self.repo.try_claim(key, &owner, duration_ms(self.lease), now_ms())? {
            return Ok(None);
        }
        let renewal = self.spawn_renewal(key, &owner).drop_guard();
        Ok(Some(LockGuard::Lease { owner, renewal }))
    }

    fn spawn_renewal(&self, key: &str, owner: &str) -> CancellationToken {
        let token = CancellationToken::new();
        let stop = token.clone();
        let repo = self.repo.clone();
        let key = key.to_owned();
        let owner = owner.to_owned();
        let lease_ms = duration_ms(self.lease);
        let period = (self.lease / 3).max(Duration::from_millis(10));

        drop(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            let _ = ticker.tick().await;
            loop {
                tokio::select! {
                    () = stop.cancelled() => break,
                    _ = ticker.tick() => match repo.renew(&key, &owner, lease_ms, now_ms()) {
                        Ok(true) => debug!(key, "lease renewed"),
                        Ok(false) => {
                            warn!(key, "lease lost before renewal");
                            break;
                        }
                        Err(e) => warn!(key, error = %e, "lease renewal failed"),
                    },
                }
            }
        }));
        token
    }
}

#[async_trait]
impl LockBackend for LeaseLockBackend {
    fn kind(&self) -> LockBackendKind {
        LockBackendKind::Lease
    }

    async fn acquire(&self, key: &str) -> Result<LockGuard, LockError> {
        loop {
            if let Some(guard) = self.claim(key)? {
                return Ok(guard);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn try_acquire(&self, key: &str) -> Result<Option<LockGuard>, LockError> {
        self.claim(key)
    }

    async fn release(&self, key: &str, guard: LockGuard) -> Result<(), LockError> {
        match guard {
            LockGuard::Lease { owner, renewal } => {
                drop(renewal);
                if !self.repo.release(key, &owner)? {
                    warn!(key, "lease already gone at release");
                }
                Ok(())
            }
            LockGuard::Local(_) => Err(LockError::Backend(
                "local guard released through the lease backend".into(),
            )),
        }
    }

    async fn is_locked(&self, key: &str) -> Result<bool, LockError> {
        Ok(self.repo.holder(key, now_ms())?.is_some())
    }

    fn drop_if_unused(&self, key: &str) -> bool {
        match self.repo.purge_expired(now_ms()) {
            Ok(removed) => {
                if removed > 0 {
                    debug!(key, removed, "purged expired leases");
                }
                removed > 0
            }
            Err(e) => {
                warn!(key, error = %e, "lease purge failed");
                false
            }
        }
    }
}
