//! Task ledger entries.
//!
//! Tasks move forward only: `Pending -> Completed` or `Pending -> Failed`.
//! Both outcomes are terminal; reopening work means adding a new task.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Status of a sub-task.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Not finished yet.
    #[default]
    Pending,
    /// Finished successfully.
    Completed,
    /// Finished unsuccessfully.
    Failed,
}

impl TaskStatus {
    /// Completed and failed tasks never change again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether `self -> next` is an allowed transition.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        self == Self::Pending && next.is_terminal()
    }

    /// Wire name of the status.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

/// One sub-task produced by decomposition.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Sequential id within the session (`"1"`, `"2"`, ...).
    pub id: String,
    /// What needs to be done.
    pub description: String,
    /// Current status.
    pub status: TaskStatus,
    /// Lower runs first.
    pub priority: u32,
    /// Outcome text, once known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last status or result change.
    pub updated_at: DateTime<Utc>,
}

/// One recorded status change.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskTransition {
    /// Task that changed.
    pub task_id: String,
    /// Previous status.
    pub from: TaskStatus,
    /// New status.
    pub to: TaskStatus,
    /// When it happened.
    pub at: DateTime<Utc>,
}

/// Aggregate counts over a ledger.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStats {
    /// All tasks.
    pub total: usize,
    /// Pending tasks.
    pub pending: usize,
    /// Completed tasks.
    pub completed: usize,
    /// Failed tasks.
    pub failed: usize,
}
