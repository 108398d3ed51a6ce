//! Session status and the persistence boundary.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::PersistenceError;
use crate::ids::SessionId;
use crate::messages::Message;
use crate::tasks::{Task, TaskTransition};

/// Lifecycle status of a session.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Created, no run yet.
    #[default]
    Idle,
    /// A run is in progress (or paused awaiting continuation).
    Running,
    /// A run was asked to stop and is winding down.
    Interrupted,
    /// The last run finished.
    Completed,
    /// The last run failed.
    Error,
}

impl SessionStatus {
    /// Wire name of the status.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Interrupted => "interrupted",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(Self::Idle),
            "running" => Ok(Self::Running),
            "interrupted" => Ok(Self::Interrupted),
            "completed" => Ok(Self::Completed),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown session status: {other}")),
        }
    }
}

/// Everything needed to resume a session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    /// Session id.
    pub session_id: SessionId,
    /// Status at save time.
    pub status: SessionStatus,
    /// Merged message history.
    pub messages: Vec<Message>,
    /// Task ledger contents.
    pub tasks: Vec<Task>,
    /// Task status history.
    #[serde(default)]
    pub task_history: Vec<TaskTransition>,
    /// Audit data (observations, budget, usage).
    #[serde(default)]
    pub audit_state: Map<String, Value>,
    /// Save time.
    pub saved_at: DateTime<Utc>,
}

/// Durable storage for session snapshots.
#[async_trait]
pub trait SessionPersister: Send + Sync {
    /// Write (or overwrite) the snapshot for its session id.
    async fn save(&self, snapshot: &SessionSnapshot) -> Result<(), PersistenceError>;

    /// Load the last snapshot for `session_id`, if any.
    async fn load(&self, session_id: &SessionId) -> Result<Option<SessionSnapshot>, PersistenceError>;
}
