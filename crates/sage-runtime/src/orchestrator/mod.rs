//! Orchestration: one locked run of the phase loop per session.
//!
//! - **orchestrator**: Resolve the session, take its lock, spawn the loop
//! - **run_loop**: Decompose, iterate plan/execute/observe, summarise, clean up
//! - **fanout**: Delegate pending tasks to isolated sub-sessions

mod fanout;
#[allow(clippy::module_inception)]
mod orchestrator;
mod run_loop;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tracing::error;

use sage_core::{Message, SessionId};
use sage_settings::OrchestrationSettings;

pub use orchestrator::Orchestrator;

/// Loop limits and fan-out behaviour.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OrchestratorConfig {
    /// Plan/execute/observe iterations per run unless the request overrides it.
    pub max_loop_count: usize,
    /// Model/tool round trips inside one phase.
    pub max_tool_rounds: usize,
    /// Delegate pending tasks to sub-sessions during execute.
    pub parallel_subtasks: bool,
    /// Sub-sessions in flight at once.
    pub max_parallel: usize,
    /// Fragments buffered between the loop and the caller.
    pub channel_capacity: usize,
}

impl OrchestratorConfig {
    /// Config from the `orchestration` settings section.
    pub fn from_settings(settings: &OrchestrationSettings) -> Self {
        Self {
            max_loop_count: settings.max_loop_count,
            max_tool_rounds: settings.max_tool_rounds,
            parallel_subtasks: settings.parallel_subtasks,
            max_parallel: settings.max_parallel.max(1),
            channel_capacity: 256,
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self::from_settings(&OrchestrationSettings::default())
    }
}

/// One user request against a session.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RunRequest {
    /// Session to continue. A fresh id is generated when absent.
    #[serde(default)]
    pub session_id: Option<SessionId>,
    /// New messages, usually a single user message.
    #[serde(default)]
    pub messages: Vec<Message>,
    /// Override for the iteration ceiling.
    #[serde(default)]
    pub max_loop_count: Option<usize>,
}

impl RunRequest {
    /// Request with a single user message.
    pub fn user(query: impl Into<String>) -> Self {
        Self {
            messages: vec![Message::user(query)],
            ..Self::default()
        }
    }

    /// Continue `session_id`.
    #[must_use]
    pub fn with_session(mut self, session_id: SessionId) -> Self {
        self.session_id = Some(session_id);
        self
    }

    /// Override the iteration ceiling.
    #[must_use]
    pub fn with_max_loop_count(mut self, count: usize) -> Self {
        self.max_loop_count = Some(count);
        self
    }
}

/// How a run ended.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    /// All tasks finished or the observer declared the run complete.
    Completed,
    /// The iteration ceiling was hit with work left; the session can be continued.
    NeedsContinuation,
    /// The observer asked the user for more information.
    NeedsUserInput,
    /// The run was interrupted or the caller went away.
    Interrupted,
    /// A phase failed.
    Failed {
        /// Error category (`upstream`, `malformed`, ...).
        category: String,
        /// Error text.
        message: String,
    },
}

/// A started run: its fragment stream and its eventual outcome.
#[derive(Debug)]
pub struct SessionRun {
    /// Session the run belongs to.
    pub session_id: SessionId,
    /// Fragments in emission order. Dropping this interrupts the run.
    pub messages: ReceiverStream<Message>,
    /// Resolves after cleanup (save, evict, unlock) has finished.
    pub outcome: JoinHandle<RunOutcome>,
}

impl SessionRun {
    /// Drain every fragment, then wait for the outcome.
    pub async fn collect(self) -> (Vec<Message>, RunOutcome) {
        let Self { messages, outcome, .. } = self;
        let fragments: Vec<Message> = messages.collect().await;
        (fragments, join_outcome(outcome).await)
    }
}

async fn join_outcome(handle: JoinHandle<RunOutcome>) -> RunOutcome {
    match handle.await {
        Ok(outcome) => outcome,
        Err(err) => {
            error!(error = %err, "run task failed");
            RunOutcome::Failed {
                category: "internal".into(),
                message: err.to_string(),
            }
        }
    }
}
