//! Live sessions by id.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, instrument};

use sage_context::{BudgetConfig, BudgetRatios};
use sage_core::{SessionId, SessionSnapshot};
use sage_settings::BudgetSettings;

use super::context::SessionContext;

/// Live sessions by id.
///
/// There is no expiry here: the orchestrator evicts a session once its run
/// has finished and been persisted.
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Arc<SessionContext>>,
    budget: BudgetConfig,
}

impl SessionRegistry {
    /// Empty registry; new sessions get `budget`.
    pub fn new(budget: BudgetConfig) -> Self {
        Self {
            sessions: DashMap::new(),
            budget,
        }
    }

    /// Registry whose sessions budget with the `budget` settings section.
    pub fn from_settings(settings: &BudgetSettings) -> Self {
        Self::new(BudgetConfig {
            max_model_len: settings.max_model_len,
            ratios: BudgetRatios {
                history: settings.history_ratio,
                active: settings.active_ratio,
                new_output: settings.new_output_ratio,
            },
            recent_turns: settings.recent_turns,
        })
    }

    /// Budget configuration handed to new sessions.
    pub fn budget_config(&self) -> &BudgetConfig {
        &self.budget
    }

    /// Register a fresh session under `id`, replacing any previous one.
    #[instrument(skip(self), fields(session_id = %id))]
    pub fn create(&self, id: SessionId) -> Arc<SessionContext> {
        let ctx = Arc::new(SessionContext::new(id.clone(), self.budget.clone()));
        if self.sessions.insert(id, ctx.clone()).is_some() {
            debug!("replaced existing session");
        }
        ctx
    }

    /// Register a session rebuilt from a snapshot.
    #[instrument(skip_all, fields(session_id = %snapshot.session_id))]
    pub fn restore(&self, snapshot: SessionSnapshot) -> Arc<SessionContext> {
        let id = snapshot.session_id.clone();
        let ctx = Arc::new(SessionContext::from_snapshot(snapshot, self.budget.clone()));
        let _ = self.sessions.insert(id, ctx.clone());
        debug!("session restored");
        ctx
    }

    /// Live session by id.
    pub fn get(&self, id: &SessionId) -> Option<Arc<SessionContext>> {
        self.sessions.get(id).map(|entry| entry.value().clone())
    }

    /// Live session by id, creating it if absent.
    pub fn get_or_create(&self, id: &SessionId) -> Arc<SessionContext> {
        self.sessions
            .entry(id.clone())
            .or_insert_with(|| Arc::new(SessionContext::new(id.clone(), self.budget.clone())))
            .value()
            .clone()
    }

    /// Remove a session. Returns it if it was registered.
    #[instrument(skip(self), fields(session_id = %id))]
    pub fn evict(&self, id: &SessionId) -> Option<Arc<SessionContext>> {
        let removed = self.sessions.remove(id).map(|(_, ctx)| ctx);
        if removed.is_some() {
            debug!("session evicted");
        }
        removed
    }

    /// Interrupt a live session. Returns whether it was found.
    pub fn interrupt(&self, id: &SessionId) -> bool {
        match self.get(id) {
            Some(ctx) => {
                ctx.interrupt();
                true
            }
            None => false,
        }
    }

    /// Ids of live sessions.
    pub fn ids(&self) -> Vec<SessionId> {
        self.sessions.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no sessions are live.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
