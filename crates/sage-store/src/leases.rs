//! Expiring lock leases.
//!
//! A lease row names the owner and an absolute expiry in epoch milliseconds.
//! A claim succeeds when no row exists, the row has expired, or the caller
//! already owns it. Callers pass `now_ms` explicitly so expiry is testable.

use chrono::Utc;
use tracing::{debug, instrument};

use crate::database::Database;
use crate::error::StoreError;

/// Lease table access.
#[derive(Clone)]
pub struct LeaseRepo {
    db: Database,
}

impl LeaseRepo {
    /// Wrap a database handle.
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Try to take (or re-take) the lease on `key` until `now_ms + lease_ms`.
    #[instrument(skip(self))]
    pub fn try_claim(
        &self,
        key: &str,
        owner: &str,
        lease_ms: i64,
        now_ms: i64,
    ) -> Result<bool, StoreError> {
        let expires = now_ms.saturating_add(lease_ms);
        let acquired_at = Utc::now().to_rfc3339();
        let changed = self.db.with_conn(|conn| {
            Ok(conn.execute(
                "INSERT INTO lock_leases (key, owner, expires_at_ms, acquired_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(key) DO UPDATE SET
                    owner = excluded.owner,
                    expires_at_ms = excluded.expires_at_ms,
                    acquired_at = excluded.acquired_at
                 WHERE lock_leases.expires_at_ms <= ?5 OR lock_leases.owner = excluded.owner",
                rusqlite::params![key, owner, expires, acquired_at, now_ms],
            )?)
        })?;
        let claimed = changed > 0;
        debug!(claimed, "lease claim");
        Ok(claimed)
    }

    /// Extend a lease the caller still owns. Returns `false` if it was lost.
    pub fn renew(&self, key: &str, owner: &str, lease_ms: i64, now_ms: i64) -> Result<bool, StoreError> {
        let expires = now_ms.saturating_add(lease_ms);
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE lock_leases SET expires_at_ms = ?3
                 WHERE key = ?1 AND owner = ?2 AND expires_at_ms > ?4",
                rusqlite::params![key, owner, expires, now_ms],
            )?;
            Ok(changed > 0)
        })
    }

    /// Drop the lease if `owner` holds it.
    #[instrument(skip(self))]
    pub fn release(&self, key: &str, owner: &str) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "DELETE FROM lock_leases WHERE key = ?1 AND owner = ?2",
                [key, owner],
            )?;
            Ok(changed > 0)
        })
    }

    /// Current unexpired holder of `key`.
    pub fn holder(&self, key: &str, now_ms: i64) -> Result<Option<String>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT owner FROM lock_leases WHERE key = ?1 AND expires_at_ms > ?2",
            )?;
            let mut rows = stmt.query(rusqlite::params![key, now_ms])?;
            match rows.next()? {
                Some(row) => Ok(Some(row.get(0)?)),
                None => Ok(None),
            }
        })
    }

    /// Delete every expired lease. Returns how many were removed.
    pub fn purge_expired(&self, now_ms: i64) -> Result<usize, StoreError> {
        self.db.with_conn(|conn| {
            Ok(conn.execute(
                "DELETE FROM lock_leases WHERE expires_at_ms <= ?1",
                [now_ms],
            )?)
        })
    }
}
