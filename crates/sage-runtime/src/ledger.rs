//! Task ledger.
//!
//! Holds the sub-tasks of one session. Ids are sequential strings starting
//! at `"1"`. Status moves forward only; a terminal task is never reopened.

use chrono::Utc;
use tracing::{debug, warn};

use sage_core::{Task, TaskStats, TaskStatus, TaskTransition};

/// Ledger failures.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    /// No task has this id.
    #[error("task not found: {0}")]
    NotFound(String),
    /// The requested change would move a terminal task.
    #[error("task {id}: cannot move from {from} to {to}")]
    InvalidTransition {
        /// Task id.
        id: String,
        /// Current status.
        from: TaskStatus,
        /// Requested status.
        to: TaskStatus,
    },
}

/// Ordered collection of tasks with transition history.
#[derive(Clone, Debug)]
pub struct TaskLedger {
    tasks: Vec<Task>,
    history: Vec<TaskTransition>,
    next_id: u64,
}

impl Default for TaskLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskLedger {
    /// Empty ledger.
    pub fn new() -> Self {
        Self {
            tasks: Vec::new(),
            history: Vec::new(),
            next_id: 1,
        }
    }

    /// Rebuild from persisted tasks and history.
    pub fn restore(tasks: Vec<Task>, history: Vec<TaskTransition>) -> Self {
        let next_id = tasks
            .iter()
            .filter_map(|t| t.id.parse::<u64>().ok())
            .max()
            .map_or(1, |max| max + 1);
        Self {
            tasks,
            history,
            next_id,
        }
    }

    /// Insert tasks in order; priority follows insertion order. Blank
    /// descriptions are skipped. Returns the new ids.
    pub fn add_batch<I, S>(&mut self, descriptions: I) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let now = Utc::now();
        let mut ids = Vec::new();
        for description in descriptions {
            let description: String = description.into();
            let description = description.trim();
            if description.is_empty() {
                continue;
            }
            let id = self.next_id.to_string();
            self.next_id += 1;
            self.tasks.push(Task {
                id: id.clone(),
                description: description.to_owned(),
                status: TaskStatus::Pending,
                priority: u32::try_from(self.tasks.len() + 1).unwrap_or(u32::MAX),
                result: None,
                created_at: now,
                updated_at: now,
            });
            ids.push(id);
        }
        debug!(added = ids.len(), total = self.tasks.len(), "tasks added");
        ids
    }

    /// Move a task to `status`. Repeating the current status is a no-op and
    /// returns `false`.
    pub fn update_status(&mut self, id: &str, status: TaskStatus) -> Result<bool, LedgerError> {
        let task = self
            .tasks
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| LedgerError::NotFound(id.to_owned()))?;

        if task.status == status {
            return Ok(false);
        }
        if !task.status.can_transition_to(status) {
            warn!(task_id = id, from = %task.status, to = %status, "rejected task transition");
            return Err(LedgerError::InvalidTransition {
                id: id.to_owned(),
                from: task.status,
                to: status,
            });
        }

        let now = Utc::now();
        self.history.push(TaskTransition {
            task_id: id.to_owned(),
            from: task.status,
            to: status,
            at: now,
        });
        task.status = status;
        task.updated_at = now;
        debug!(task_id = id, to = %status, "task status changed");
        Ok(true)
    }

    /// Record the outcome text of a task.
    pub fn set_result(&mut self, id: &str, result: impl Into<String>) -> Result<(), LedgerError> {
        let task = self
            .tasks
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| LedgerError::NotFound(id.to_owned()))?;
        task.result = Some(result.into());
        task.updated_at = Utc::now();
        Ok(())
    }

    /// Task by id.
    pub fn get(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    /// Tasks with `status`, in priority order.
    pub fn by_status(&self, status: TaskStatus) -> Vec<&Task> {
        let mut tasks: Vec<&Task> = self.tasks.iter().filter(|t| t.status == status).collect();
        tasks.sort_by_key(|t| t.priority);
        tasks
    }

    /// True iff every task is terminal.
    pub fn all_done(&self) -> bool {
        self.tasks.iter().all(|t| t.status.is_terminal())
    }

    /// Whether any task is still pending.
    pub fn has_pending(&self) -> bool {
        self.tasks.iter().any(|t| t.status == TaskStatus::Pending)
    }

    /// Counts per status.
    pub fn stats(&self) -> TaskStats {
        let mut stats = TaskStats {
            total: self.tasks.len(),
            ..TaskStats::default()
        };
        for task in &self.tasks {
            match task.status {
                TaskStatus::Pending => stats.pending += 1,
                TaskStatus::Completed => stats.completed += 1,
                TaskStatus::Failed => stats.failed += 1,
            }
        }
        stats
    }

    /// All tasks in insertion order.
    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    /// Every recorded transition, oldest first.
    pub fn history(&self) -> &[TaskTransition] {
        &self.history
    }

    /// Number of tasks.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether the ledger has no tasks.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
