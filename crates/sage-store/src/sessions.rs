//! Session snapshot storage and the `SessionPersister` over it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use sage_core::{PersistenceError, SessionId, SessionPersister, SessionSnapshot, SessionStatus};

use crate::database::Database;
use crate::error::StoreError;

/// Lightweight listing row for a stored session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    /// Session id.
    pub id: SessionId,
    /// Status at last save.
    pub status: SessionStatus,
    /// Number of merged messages.
    pub message_count: usize,
    /// Number of ledger tasks.
    pub task_count: usize,
    /// Last save time.
    pub saved_at: DateTime<Utc>,
}

/// Reads and writes session snapshots.
#[derive(Clone)]
pub struct SessionRepo {
    db: Database,
}

fn corrupt(column: &str, detail: impl std::fmt::Display) -> StoreError {
    StoreError::CorruptRow(format!("sessions.{column}: {detail}"))
}

fn parse_column<T: serde::de::DeserializeOwned>(raw: &str, column: &str) -> Result<T, StoreError> {
    serde_json::from_str(raw).map_err(|e| corrupt(column, e))
}

fn parse_saved_at(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| corrupt("saved_at", e))
}

impl SessionRepo {
    /// Wrap a database handle.
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert or overwrite the snapshot for its session id.
    #[instrument(skip_all, fields(session_id = %snapshot.session_id, status = %snapshot.status))]
    pub fn save(&self, snapshot: &SessionSnapshot) -> Result<(), StoreError> {
        let messages = serde_json::to_string(&snapshot.messages)?;
        let tasks = serde_json::to_string(&snapshot.tasks)?;
        let history = serde_json::to_string(&snapshot.task_history)?;
        let audit = serde_json::to_string(&snapshot.audit_state)?;

        self.db.with_conn(|conn| {
            let _ = conn.execute(
                "INSERT INTO sessions (id, status, messages, tasks, task_history, audit_state,
                                       message_count, task_count, saved_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(id) DO UPDATE SET
                    status = excluded.status,
                    messages = excluded.messages,
                    tasks = excluded.tasks,
                    task_history = excluded.task_history,
                    audit_state = excluded.audit_state,
                    message_count = excluded.message_count,
                    task_count = excluded.task_count,
                    saved_at = excluded.saved_at",
                rusqlite::params![
                    snapshot.session_id.as_str(),
                    snapshot.status.as_str(),
                    messages,
                    tasks,
                    history,
                    audit,
                    i64::try_from(snapshot.messages.len()).unwrap_or(i64::MAX),
                    i64::try_from(snapshot.tasks.len()).unwrap_or(i64::MAX),
                    snapshot.saved_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })?;
        debug!(messages = snapshot.messages.len(), tasks = snapshot.tasks.len(), "session saved");
        Ok(())
    }

    /// Load the snapshot for `id`, if one was saved.
    #[instrument(skip(self), fields(session_id = %id))]
    pub fn load(&self, id: &SessionId) -> Result<Option<SessionSnapshot>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT status, messages, tasks, task_history, audit_state, saved_at
                 FROM sessions WHERE id = ?1",
            )?;
            let mut rows = stmt.query([id.as_str()])?;
            let Some(row) = rows.next()? else {
                return Ok(None);
            };

            let status: String = row.get(0)?;
            let messages: String = row.get(1)?;
            let tasks: String = row.get(2)?;
            let history: String = row.get(3)?;
            let audit: String = row.get(4)?;
            let saved_at: String = row.get(5)?;

            Ok(Some(SessionSnapshot {
                session_id: id.clone(),
                status: status.parse().map_err(|e: String| corrupt("status", e))?,
                messages: parse_column(&messages, "messages")?,
                tasks: parse_column(&tasks, "tasks")?,
                task_history: parse_column(&history, "task_history")?,
                audit_state: parse_column(&audit, "audit_state")?,
                saved_at: parse_saved_at(&saved_at)?,
            }))
        })
    }

    /// Most recently saved sessions first.
    #[instrument(skip(self))]
    pub fn list(&self, limit: u32) -> Result<Vec<SessionSummary>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, status, message_count, task_count, saved_at
                 FROM sessions ORDER BY saved_at DESC LIMIT ?1",
            )?;
            let mut rows = stmt.query([limit])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let id: String = row.get(0)?;
                let status: String = row.get(1)?;
                let message_count: i64 = row.get(2)?;
                let task_count: i64 = row.get(3)?;
                let saved_at: String = row.get(4)?;
                out.push(SessionSummary {
                    id: SessionId::from(id),
                    status: status.parse().map_err(|e: String| corrupt("status", e))?,
                    message_count: usize::try_from(message_count)
                        .map_err(|e| corrupt("message_count", e))?,
                    task_count: usize::try_from(task_count).map_err(|e| corrupt("task_count", e))?,
                    saved_at: parse_saved_at(&saved_at)?,
                });
            }
            Ok(out)
        })
    }

    /// Remove a stored session. Returns whether a row existed.
    #[instrument(skip(self), fields(session_id = %id))]
    pub fn delete(&self, id: &SessionId) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let changed = conn.execute("DELETE FROM sessions WHERE id = ?1", [id.as_str()])?;
            Ok(changed > 0)
        })
    }
}

/// [`SessionPersister`] backed by the `sessions` table.
#[derive(Clone)]
pub struct SqlitePersister {
    repo: SessionRepo,
}

impl SqlitePersister {
    /// Wrap a database handle.
    pub fn new(db: Database) -> Self {
        Self {
            repo: SessionRepo::new(db),
        }
    }

    /// Underlying repo, for listing and deletion.
    pub fn repo(&self) -> &SessionRepo {
        &self.repo
    }
}

#[async_trait]
impl SessionPersister for SqlitePersister {
    async fn save(&self, snapshot: &SessionSnapshot) -> Result<(), PersistenceError> {
        self.repo
            .save(snapshot)
            .map_err(|e| PersistenceError::new("save", e.to_string()))
    }

    async fn load(&self, session_id: &SessionId) -> Result<Option<SessionSnapshot>, PersistenceError> {
        self.repo
            .load(session_id)
            .map_err(|e| PersistenceError::new("load", e.to_string()))
    }
}
