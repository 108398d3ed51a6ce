//! State of one session: messages, ledger, audit data, status and lock.

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{Map, Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use sage_context::{BudgetConfig, merge_into};
use sage_core::model::TokenUsage;
use sage_core::{
    Message, PersistenceError, Role, SessionId, SessionPersister, SessionSnapshot, SessionStatus,
};

use crate::ledger::TaskLedger;
use crate::lock::LockHandle;

/// Audit key holding every observation result, oldest first.
pub const AUDIT_OBSERVATIONS: &str = "all_observations";
/// Audit key holding the last budget computation.
pub const AUDIT_BUDGET: &str = "budget";
/// Audit key holding token usage totals.
pub const AUDIT_TOKEN_USAGE: &str = "token_usage";
/// Audit key set when the iteration ceiling was hit.
pub const AUDIT_NEEDS_CONTINUATION: &str = "needs_continuation";

/// Mutable part of a session.
#[derive(Clone, Debug, Default)]
pub struct SessionState {
    /// Lifecycle status.
    pub status: SessionStatus,
    /// Merged message history.
    pub messages: Vec<Message>,
    /// Sub-tasks.
    pub ledger: TaskLedger,
    /// Audit data persisted with the snapshot.
    pub audit_state: Map<String, Value>,
}

/// One session: messages, ledger, status, the cancel token of the current
/// run and the lock that run holds.
pub struct SessionContext {
    id: SessionId,
    budget: BudgetConfig,
    state: Mutex<SessionState>,
    cancel: Mutex<CancellationToken>,
    lock: Mutex<Option<LockHandle>>,
}

impl SessionContext {
    /// Fresh idle session.
    pub fn new(id: SessionId, budget: BudgetConfig) -> Self {
        Self::with_state(id, budget, SessionState::default(), CancellationToken::new())
    }

    /// Session rebuilt from a persisted snapshot.
    pub fn from_snapshot(snapshot: SessionSnapshot, budget: BudgetConfig) -> Self {
        let state = SessionState {
            status: snapshot.status,
            messages: snapshot.messages,
            ledger: TaskLedger::restore(snapshot.tasks, snapshot.task_history),
            audit_state: snapshot.audit_state,
        };
        Self::with_state(snapshot.session_id, budget, state, CancellationToken::new())
    }

    /// Isolated sub-session seeded with a read-only copy of the parent's
    /// messages. It is cancelled together with the parent.
    pub fn child(
        id: SessionId,
        budget: BudgetConfig,
        messages: Vec<Message>,
        parent_cancel: &CancellationToken,
    ) -> Self {
        let state = SessionState {
            status: SessionStatus::Running,
            messages,
            ..SessionState::default()
        };
        Self::with_state(id, budget, state, parent_cancel.child_token())
    }

    fn with_state(
        id: SessionId,
        budget: BudgetConfig,
        state: SessionState,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            budget,
            state: Mutex::new(state),
            cancel: Mutex::new(cancel),
            lock: Mutex::new(None),
        }
    }

    /// Session id.
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Budget configuration used for every model call.
    pub fn budget_config(&self) -> &BudgetConfig {
        &self.budget
    }

    // ── status ──────────────────────────────────────────────────────────

    /// Current status.
    pub fn status(&self) -> SessionStatus {
        self.state.lock().status
    }

    /// Change status.
    pub fn set_status(&self, status: SessionStatus) {
        let previous = std::mem::replace(&mut self.state.lock().status, status);
        if previous != status {
            debug!(session_id = %self.id, from = %previous, to = %status, "session status changed");
        }
    }

    /// Start a run: fresh cancel token, status `Running`.
    pub fn begin_run(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *self.cancel.lock() = token.clone();
        self.set_status(SessionStatus::Running);
        token
    }

    /// Token of the current run.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.lock().clone()
    }

    /// Mark `Interrupted` and cancel the current run.
    pub fn interrupt(&self) {
        self.set_status(SessionStatus::Interrupted);
        self.cancel.lock().cancel();
        info!(session_id = %self.id, "session interrupted");
    }

    /// Whether the current run should stop.
    pub fn is_interrupted(&self) -> bool {
        self.status() == SessionStatus::Interrupted || self.cancel.lock().is_cancelled()
    }

    // ── messages ────────────────────────────────────────────────────────

    /// Merge fragments into the history. Fragments that belong to another
    /// session, carry the `system` role, or fail validation are dropped.
    /// Returns how many were merged.
    pub fn add_messages<I>(&self, fragments: I) -> usize
    where
        I: IntoIterator<Item = Message>,
    {
        let mut state = self.state.lock();
        let mut merged = 0;
        for fragment in fragments {
            if fragment.session_id.as_ref().is_some_and(|sid| *sid != self.id) {
                warn!(
                    session_id = %self.id,
                    fragment_session = ?fragment.session_id,
                    message_id = %fragment.id,
                    "dropping fragment from another session"
                );
                continue;
            }
            if fragment.role == Role::System {
                warn!(session_id = %self.id, message_id = %fragment.id, "dropping system-role fragment");
                continue;
            }
            if let Err(e) = fragment.validate() {
                warn!(session_id = %self.id, error = %e, "dropping invalid fragment");
                continue;
            }
            match merge_into(&mut state.messages, fragment) {
                Ok(_) => merged += 1,
                Err(e) => warn!(session_id = %self.id, error = %e, "merge rejected fragment"),
            }
        }
        merged
    }

    /// Copy of the merged history.
    pub fn messages(&self) -> Vec<Message> {
        self.state.lock().messages.clone()
    }

    /// Number of merged messages.
    pub fn message_count(&self) -> usize {
        self.state.lock().messages.len()
    }

    /// Content of the most recent user message that opened a turn.
    pub fn last_user_query(&self) -> String {
        self.state
            .lock()
            .messages
            .iter()
            .rev()
            .find(|m| m.starts_turn())
            .map(|m| m.content_str().to_owned())
            .unwrap_or_default()
    }

    // ── ledger ──────────────────────────────────────────────────────────

    /// Run `f` with the ledger.
    pub fn with_ledger<R>(&self, f: impl FnOnce(&mut TaskLedger) -> R) -> R {
        f(&mut self.state.lock().ledger)
    }

    // ── audit ───────────────────────────────────────────────────────────

    /// Set an audit entry.
    pub fn set_audit(&self, key: &str, value: Value) {
        let _ = self.state.lock().audit_state.insert(key.to_owned(), value);
    }

    /// Append to an audit array, creating it if needed.
    pub fn push_audit(&self, key: &str, value: Value) {
        let mut state = self.state.lock();
        let entry = state
            .audit_state
            .entry(key.to_owned())
            .or_insert_with(|| Value::Array(Vec::new()));
        match entry {
            Value::Array(items) => items.push(value),
            other => *other = Value::Array(vec![value]),
        }
    }

    /// Read an audit entry.
    pub fn audit(&self, key: &str) -> Option<Value> {
        self.state.lock().audit_state.get(key).cloned()
    }

    /// Add one call's usage to the session and per-phase totals.
    pub fn record_usage(&self, phase: &str, usage: &TokenUsage) {
        let mut state = self.state.lock();
        let entry = state
            .audit_state
            .entry(AUDIT_TOKEN_USAGE.to_owned())
            .or_insert_with(|| json!({"total": {}, "by_phase": {}}));

        let add = |slot: &mut Value| {
            let mut current: TokenUsage = serde_json::from_value(slot.clone()).unwrap_or_default();
            current.accumulate(usage);
            *slot = serde_json::to_value(current).unwrap_or(Value::Null);
        };

        if !entry.is_object() {
            *entry = json!({"total": {}, "by_phase": {}});
        }
        add(&mut entry["total"]);
        if !entry["by_phase"].is_object() {
            entry["by_phase"] = json!({});
        }
        add(&mut entry["by_phase"][phase]);
    }

    // ── persistence ─────────────────────────────────────────────────────

    /// Copy of everything that is persisted.
    pub fn snapshot(&self) -> SessionSnapshot {
        let state = self.state.lock();
        SessionSnapshot {
            session_id: self.id.clone(),
            status: state.status,
            messages: state.messages.clone(),
            tasks: state.ledger.tasks().to_vec(),
            task_history: state.ledger.history().to_vec(),
            audit_state: state.audit_state.clone(),
            saved_at: Utc::now(),
        }
    }

    /// Write the snapshot through `persister`.
    #[instrument(skip_all, fields(session_id = %self.id))]
    pub async fn save(&self, persister: &dyn SessionPersister) -> Result<(), PersistenceError> {
        let snapshot = self.snapshot();
        persister.save(&snapshot).await?;
        debug!(messages = snapshot.messages.len(), tasks = snapshot.tasks.len(), "session saved");
        Ok(())
    }

    // ── lock ────────────────────────────────────────────────────────────

    /// Keep the run's lock with the session.
    pub fn attach_lock(&self, handle: LockHandle) {
        if self.lock.lock().replace(handle).is_some() {
            warn!(session_id = %self.id, "replaced a lock handle that was never released");
        }
    }

    /// Take the lock handle for release.
    pub fn take_lock(&self) -> Option<LockHandle> {
        self.lock.lock().take()
    }

    /// Whether this session currently keeps a lock handle.
    pub fn holds_lock(&self) -> bool {
        self.lock.lock().is_some()
    }
}

impl std::fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionContext")
            .field("id", &self.id)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use sage_core::{MessageId, MessageType, TaskStatus};
    use tracing::Level;

    fn ctx() -> SessionContext {
        SessionContext::new(SessionId::from("s1"), BudgetConfig::default())
    }

    fn fragment(id: &str, text: &str) -> Message {
        Message::assistant(MessageId::from(id), MessageType::Execution, text)
    }

    #[test]
    fn fragments_merge_by_id() {
        let ctx = ctx();
        let merged = ctx.add_messages([
            Message::user("find primes"),
            fragment("a", "2 "),
            fragment("a", "and 3"),
            fragment("b", "done"),
        ]);
        assert_eq!(merged, 4);
        let messages = ctx.messages();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[1].content_str(), "2 and 3");
        assert_eq!(ctx.last_user_query(), "find primes");
    }

    #[test]
    fn foreign_and_system_fragments_dropped() {
        let (logs, _guard) = sage_logging::capture_logs();
        let ctx = ctx();
        let foreign = fragment("x", "leak").with_session(SessionId::from("other"));
        let own = fragment("y", "ok").with_session(SessionId::from("s1"));
        let mut system = Message::new(MessageId::from("z"), Role::System, MessageType::System);
        system.content = Some("rules".into());

        assert_eq!(ctx.add_messages([foreign, own, system]), 1);
        assert_eq!(ctx.message_count(), 1);
        assert!(logs.has_event(Level::WARN, "another session"));
        assert!(logs.has_event(Level::WARN, "system-role"));
    }

    #[test]
    fn invalid_fragment_dropped() {
        let ctx = ctx();
        let mut tool = Message::tool_result(MessageId::from("t"), "call_1", "42");
        tool.tool_call_id = None;
        assert_eq!(ctx.add_messages([tool]), 0);
    }

    #[test]
    fn interrupt_cancels_current_run_only() {
        let ctx = ctx();
        let first = ctx.begin_run();
        assert_eq!(ctx.status(), SessionStatus::Running);
        ctx.interrupt();
        assert!(first.is_cancelled());
        assert!(ctx.is_interrupted());

        let second = ctx.begin_run();
        assert!(!second.is_cancelled());
        assert!(!ctx.is_interrupted());
    }

    #[test]
    fn usage_accumulates_per_phase() {
        let ctx = ctx();
        let usage = TokenUsage { prompt_tokens: 10, completion_tokens: 5, total_tokens: 15 };
        ctx.record_usage("plan", &usage);
        ctx.record_usage("plan", &usage);
        ctx.record_usage("execute", &usage);
        let audit = ctx.audit(AUDIT_TOKEN_USAGE).unwrap();
        assert_eq!(audit["total"]["total_tokens"], 45);
        assert_eq!(audit["by_phase"]["plan"]["prompt_tokens"], 20);
        assert_eq!(audit["by_phase"]["execute"]["completion_tokens"], 5);
    }

    #[test]
    fn push_audit_appends() {
        let ctx = ctx();
        ctx.push_audit(AUDIT_OBSERVATIONS, json!({"n": 1}));
        ctx.push_audit(AUDIT_OBSERVATIONS, json!({"n": 2}));
        assert_eq!(ctx.audit(AUDIT_OBSERVATIONS).unwrap().as_array().unwrap().len(), 2);
    }

    struct Recorder(Mutex<Vec<SessionSnapshot>>);

    #[async_trait]
    impl SessionPersister for Recorder {
        async fn save(&self, snapshot: &SessionSnapshot) -> Result<(), PersistenceError> {
            self.0.lock().push(snapshot.clone());
            Ok(())
        }

        async fn load(&self, _: &SessionId) -> Result<Option<SessionSnapshot>, PersistenceError> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn snapshot_round_trips_through_from_snapshot() {
        let ctx = ctx();
        let _ = ctx.add_messages([Message::user("q")]);
        let _ = ctx.with_ledger(|l| l.add_batch(["one", "two"]));
        let _ = ctx.with_ledger(|l| l.update_status("1", TaskStatus::Completed)).unwrap();
        ctx.set_status(SessionStatus::Completed);

        let recorder = Recorder(Mutex::new(Vec::new()));
        ctx.save(&recorder).await.unwrap();
        let saved = recorder.0.lock().pop().unwrap();
        assert_eq!(saved.tasks.len(), 2);
        assert_eq!(saved.task_history.len(), 1);

        let restored = SessionContext::from_snapshot(saved, BudgetConfig::default());
        assert_eq!(restored.status(), SessionStatus::Completed);
        assert_eq!(restored.message_count(), 1);
        assert!(restored.with_ledger(|l| l.has_pending()));
    }

    #[test]
    fn child_shares_cancellation() {
        let parent = ctx();
        let token = parent.begin_run();
        let child = SessionContext::child(
            SessionId::from("s1-sub-1"),
            BudgetConfig::default(),
            parent.messages(),
            &token,
        );
        assert!(!child.is_interrupted());
        parent.interrupt();
        assert!(child.is_interrupted());
    }
}
