//! Orchestrator: entry point for running sessions.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, instrument, warn};

use sage_core::model::ModelClient;
use sage_core::tools::ToolProvider;
use sage_core::{SessionId, SessionPersister, SessionStatus};

use super::run_loop::RunLoop;
use super::{OrchestratorConfig, RunRequest, SessionRun};
use crate::agents::{Emitter, PhaseRunner};
use crate::errors::RuntimeError;
use crate::lock::LockManager;
use crate::session::{SessionContext, SessionRegistry};

/// Runs requests against sessions, one run per session at a time.
#[derive(Clone)]
pub struct Orchestrator {
    registry: Arc<SessionRegistry>,
    locks: LockManager,
    runner: PhaseRunner,
    persister: Arc<dyn SessionPersister>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    /// Create an orchestrator.
    pub fn new(
        registry: Arc<SessionRegistry>,
        locks: LockManager,
        model: Arc<dyn ModelClient>,
        tools: Arc<dyn ToolProvider>,
        persister: Arc<dyn SessionPersister>,
        config: OrchestratorConfig,
    ) -> Self {
        let runner = PhaseRunner::new(model, tools, config.max_tool_rounds);
        Self {
            registry,
            locks,
            runner,
            persister,
            config,
        }
    }

    /// Send this sampling temperature with every model call.
    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.runner = self.runner.with_temperature(temperature);
        self
    }

    /// Live sessions.
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Session locks.
    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    /// Loop limits in effect.
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Start a run.
    ///
    /// Resolves the session (live, persisted, or new), takes its lock and
    /// spawns the loop. Fails with a retryable lock error while another run
    /// holds the session; a run that is winding down after an interrupt is
    /// waited for up to the lock timeout.
    #[instrument(skip_all, fields(session_id))]
    pub async fn run_stream(&self, request: RunRequest) -> Result<SessionRun, RuntimeError> {
        let session_id = request.session_id.clone().unwrap_or_default();
        let _ = tracing::Span::current().record("session_id", session_id.as_str());

        let session = self.resolve(&session_id).await?;
        let winding_down = session.status() == SessionStatus::Interrupted;
        let handle = self.locks.acquire_default(session_id.as_str(), winding_down).await?;

        // The previous holder may have saved and evicted while we waited.
        let session = match self.resolve(&session_id).await {
            Ok(session) => session,
            Err(err) => {
                if let Err(release_err) = self.locks.release(handle).await {
                    warn!(error = %release_err, "failed to release session lock");
                }
                return Err(err);
            }
        };
        session.attach_lock(handle);
        let _ = session.begin_run();
        let added = session.add_messages(request.messages);
        debug!(added, "request messages merged");

        let (tx, rx) = mpsc::channel(self.config.channel_capacity.max(1));
        let run = RunLoop {
            emitter: Emitter::new(session.clone(), tx),
            session,
            runner: self.runner.clone(),
            registry: self.registry.clone(),
            locks: self.locks.clone(),
            persister: self.persister.clone(),
            max_loop_count: request.max_loop_count.unwrap_or(self.config.max_loop_count),
            parallel_subtasks: self.config.parallel_subtasks,
            max_parallel: self.config.max_parallel,
        };
        let outcome = tokio::spawn(run.drive());
        info!("run started");

        Ok(SessionRun {
            session_id,
            messages: ReceiverStream::new(rx),
            outcome,
        })
    }

    /// Interrupt the live run of `session_id`. Returns whether one was found.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn interrupt(&self, session_id: &SessionId) -> bool {
        self.registry.interrupt(session_id)
    }

    /// Live session, else persisted session, else a new one.
    async fn resolve(&self, session_id: &SessionId) -> Result<Arc<SessionContext>, RuntimeError> {
        if let Some(session) = self.registry.get(session_id) {
            return Ok(session);
        }
        match self.persister.load(session_id).await? {
            Some(snapshot) => {
                if let Some(session) = self.registry.get(session_id) {
                    return Ok(session);
                }
                debug!("resuming persisted session");
                Ok(self.registry.restore(snapshot))
            }
            None => Ok(self.registry.get_or_create(session_id)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use sage_context::BudgetConfig;
    use sage_core::model::ModelRequest;
    use sage_core::tools::CompositeToolProvider;
    use sage_core::{Message, MessageType, PersistenceError, SessionSnapshot, TaskStatus};
    use sage_llm::{MockModelClient, MockResponse};
    use sage_settings::LockSettings;
    use sage_store::{Database, SqlitePersister};
    use std::time::Duration;
    use tokio_stream::StreamExt;

    use crate::lock::LockError;
    use crate::orchestrator::RunOutcome;
    use crate::session::AUDIT_NEEDS_CONTINUATION;

    /// Persister that counts saves and keeps the last snapshot per id.
    #[derive(Default)]
    struct CountingPersister {
        saved: Mutex<Vec<SessionSnapshot>>,
    }

    impl CountingPersister {
        fn saves(&self) -> usize {
            self.saved.lock().len()
        }

        fn last(&self) -> SessionSnapshot {
            self.saved.lock().last().cloned().unwrap()
        }
    }

    #[async_trait]
    impl SessionPersister for CountingPersister {
        async fn save(&self, snapshot: &SessionSnapshot) -> Result<(), PersistenceError> {
            self.saved.lock().push(snapshot.clone());
            Ok(())
        }

        async fn load(&self, session_id: &SessionId) -> Result<Option<SessionSnapshot>, PersistenceError> {
            Ok(self
                .saved
                .lock()
                .iter()
                .rev()
                .find(|s| &s.session_id == session_id)
                .cloned())
        }
    }

    fn phase_of(request: &ModelRequest) -> &'static str {
        let prompt = request.system_prompt.as_str();
        if prompt.starts_with("You split") {
            "decompose"
        } else if prompt.starts_with("You plan") {
            "plan"
        } else if prompt.contains("one task only") {
            "subtask"
        } else if prompt.starts_with("You carry out") {
            "execute"
        } else if prompt.starts_with("You review") {
            "observe"
        } else if prompt.starts_with("You summarise") {
            "stage_summary"
        } else {
            "final_summary"
        }
    }

    fn observation(status: &str, completed: &str) -> MockResponse {
        MockResponse::text(format!(
            "<analysis>checked the work</analysis><finish_percent>50</finish_percent>\
             <completion_status>{status}</completion_status>\
             <completed_task_ids>{completed}</completed_task_ids>\
             <pending_task_ids>[]</pending_task_ids><failed_task_ids>[]</failed_task_ids>"
        ))
    }

    fn primes_model() -> MockModelClient {
        MockModelClient::from_fn(|request| match phase_of(request) {
            "decompose" => MockResponse::text(
                "<task_item>List the primes below 10</task_item><task_item>Pick two of them</task_item>",
            ),
            "plan" => MockResponse::text("List primes by trial division, then pick the two smallest."),
            "execute" => MockResponse::text("Primes below 10: 2, 3, 5, 7. Picked 2 and 3."),
            "observe" => observation("completed", r#"["1", "2"]"#),
            "stage_summary" => MockResponse::text("Listed the primes and picked 2 and 3."),
            _ => MockResponse::text("Two primes below 10 are 2 and 3."),
        })
    }

    fn orchestrator(
        model: Arc<MockModelClient>,
        persister: Arc<dyn SessionPersister>,
        config: OrchestratorConfig,
    ) -> Orchestrator {
        Orchestrator::new(
            Arc::new(SessionRegistry::new(BudgetConfig::default())),
            LockManager::memory(&LockSettings {
                acquire_timeout_secs: 1,
                ..LockSettings::default()
            }),
            model,
            Arc::new(CompositeToolProvider::new()),
            persister,
            config,
        )
    }

    fn phases(model: &MockModelClient) -> Vec<&'static str> {
        model.requests().iter().map(phase_of).collect()
    }

    /// Message kinds in stream order with consecutive repeats collapsed.
    fn kind_sequence(messages: &[Message]) -> Vec<MessageType> {
        let mut kinds: Vec<MessageType> = messages
            .iter()
            .map(|m| m.kind)
            .filter(|k| *k != MessageType::TokenUsage)
            .collect();
        kinds.dedup();
        kinds
    }

    #[tokio::test]
    async fn primes_request_runs_every_phase_in_order() {
        let model = Arc::new(primes_model());
        let db = Database::in_memory().unwrap();
        let persister = Arc::new(SqlitePersister::new(db));
        let orch = orchestrator(model.clone(), persister.clone(), OrchestratorConfig::default());

        let run = orch
            .run_stream(RunRequest::user("find 2 prime numbers less than 10").with_max_loop_count(5))
            .await
            .unwrap();
        let session_id = run.session_id.clone();
        let (messages, outcome) = run.collect().await;

        assert_eq!(outcome, RunOutcome::Completed);
        assert_eq!(
            kind_sequence(&messages),
            vec![
                MessageType::TaskDecomposition,
                MessageType::Planning,
                MessageType::Execution,
                MessageType::Observation,
                MessageType::StageSummary,
                MessageType::FinalAnswer,
            ]
        );
        assert_eq!(
            phases(&model),
            vec!["decompose", "plan", "execute", "observe", "stage_summary", "final_summary"]
        );

        let snapshot = persister.load(&session_id).await.unwrap().unwrap();
        assert_eq!(snapshot.status, SessionStatus::Completed);
        assert_eq!(snapshot.tasks.len(), 2);
        assert!(snapshot.tasks.iter().all(|t| t.status == TaskStatus::Completed));
        let answer = snapshot.messages.last().unwrap();
        assert_eq!(answer.kind, MessageType::FinalAnswer);
        assert_eq!(answer.content_str(), "Two primes below 10 are 2 and 3.");
        assert_eq!(snapshot.audit_state["all_observations"].as_array().unwrap().len(), 1);

        assert!(orch.registry().get(&session_id).is_none());
        assert!(!orch.locks().is_locked(session_id.as_str()).await.unwrap());
    }

    #[tokio::test]
    async fn decomposition_keeps_only_task_items_visible() {
        let model = Arc::new(primes_model());
        let orch = orchestrator(model, Arc::new(CountingPersister::default()), OrchestratorConfig::default());

        let run = orch.run_stream(RunRequest::user("find 2 primes")).await.unwrap();
        let (messages, _) = run.collect().await;

        let shown: String = messages
            .iter()
            .filter(|m| m.kind == MessageType::TaskDecomposition)
            .filter_map(|m| m.show_content.clone())
            .collect();
        assert_eq!(shown, "List the primes below 10\nPick two of them\n");
    }

    #[tokio::test]
    async fn iteration_limit_needs_continuation() {
        let model = Arc::new(MockModelClient::from_fn(|request| match phase_of(request) {
            "decompose" => MockResponse::text("<task_item>an endless task</task_item>"),
            "observe" => observation("in_progress", "[]"),
            _ => MockResponse::text("working on it"),
        }));
        let persister = Arc::new(CountingPersister::default());
        let orch = orchestrator(model.clone(), persister.clone(), OrchestratorConfig::default());

        let run = orch
            .run_stream(RunRequest::user("never finishes").with_max_loop_count(3))
            .await
            .unwrap();
        let (messages, outcome) = run.collect().await;

        assert_eq!(outcome, RunOutcome::NeedsContinuation);
        let plans = phases(&model).iter().filter(|p| **p == "plan").count();
        assert_eq!(plans, 3);
        assert!(messages.iter().any(|m| m.kind == MessageType::FinalAnswer));
        let snapshot = persister.last();
        assert_eq!(snapshot.status, SessionStatus::Running);
        assert_eq!(snapshot.audit_state[AUDIT_NEEDS_CONTINUATION], serde_json::json!(true));
        assert_eq!(snapshot.tasks[0].status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn resumed_session_skips_decomposition() {
        let model = Arc::new(MockModelClient::from_fn(|request| match phase_of(request) {
            "decompose" => MockResponse::text("<task_item>slow task</task_item>"),
            "observe" if request.messages.iter().filter(|m| m.role == sage_core::Role::User).count() > 1 => {
                observation("completed", r#"["1"]"#)
            }
            "observe" => observation("in_progress", "[]"),
            _ => MockResponse::text("ok"),
        }));
        let persister = Arc::new(CountingPersister::default());
        let orch = orchestrator(model.clone(), persister.clone(), OrchestratorConfig::default());

        let first = orch
            .run_stream(RunRequest::user("start").with_max_loop_count(1))
            .await
            .unwrap();
        let session_id = first.session_id.clone();
        assert_eq!(first.collect().await.1, RunOutcome::NeedsContinuation);

        let second = orch
            .run_stream(RunRequest::user("continue").with_session(session_id))
            .await
            .unwrap();
        assert_eq!(second.collect().await.1, RunOutcome::Completed);

        let decomposes = phases(&model).iter().filter(|p| **p == "decompose").count();
        assert_eq!(decomposes, 1);
        assert_eq!(persister.last().tasks[0].status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn interrupt_saves_once_and_releases_lock() {
        let model = Arc::new(MockModelClient::from_fn(|request| match phase_of(request) {
            "decompose" => MockResponse::text("<task_item>a</task_item><task_item>b</task_item>"),
            "execute" => MockResponse::Hang,
            _ => MockResponse::text("planned"),
        }));
        let persister = Arc::new(CountingPersister::default());
        let orch = orchestrator(model.clone(), persister.clone(), OrchestratorConfig::default());

        let mut run = orch.run_stream(RunRequest::user("two things")).await.unwrap();
        let session_id = run.session_id.clone();
        while let Some(message) = run.messages.next().await {
            if message.kind == MessageType::Planning && message.is_final {
                break;
            }
        }
        assert!(orch.interrupt(&session_id));
        let (_, outcome) = run.collect().await;

        assert_eq!(outcome, RunOutcome::Interrupted);
        assert_eq!(persister.saves(), 1);
        let snapshot = persister.last();
        assert_eq!(snapshot.status, SessionStatus::Interrupted);
        assert_eq!(snapshot.tasks.len(), 2);
        assert!(!phases(&model).contains(&"final_summary"));
        assert!(!orch.locks().is_locked(session_id.as_str()).await.unwrap());
        assert!(orch.registry().get(&session_id).is_none());
    }

    #[tokio::test]
    async fn dropping_the_stream_interrupts() {
        let model = Arc::new(MockModelClient::from_fn(|request| match phase_of(request) {
            "decompose" => MockResponse::text("<task_item>a</task_item>"),
            "plan" => MockResponse::Hang,
            _ => MockResponse::text("unused"),
        }));
        let persister = Arc::new(CountingPersister::default());
        let orch = orchestrator(model, persister.clone(), OrchestratorConfig::default());

        let SessionRun { messages, outcome, .. } = orch.run_stream(RunRequest::user("x")).await.unwrap();
        drop(messages);
        let outcome = tokio::time::timeout(Duration::from_secs(5), outcome).await.unwrap().unwrap();

        assert_eq!(outcome, RunOutcome::Interrupted);
        assert_eq!(persister.last().status, SessionStatus::Interrupted);
    }

    #[tokio::test]
    async fn concurrent_run_on_same_session_conflicts() {
        let model = Arc::new(MockModelClient::from_fn(|request| match phase_of(request) {
            "decompose" => MockResponse::Hang,
            _ => MockResponse::text("unused"),
        }));
        let orch = orchestrator(model, Arc::new(CountingPersister::default()), OrchestratorConfig::default());
        let id = SessionId::from("busy");

        let first = orch
            .run_stream(RunRequest::user("one").with_session(id.clone()))
            .await
            .unwrap();
        let err = orch
            .run_stream(RunRequest::user("two").with_session(id.clone()))
            .await
            .unwrap_err();

        assert_matches!(err, RuntimeError::Lock(LockError::Conflict { .. }));
        assert!(err.is_retryable());
        assert!(orch.interrupt(&id));
        assert_eq!(first.collect().await.1, RunOutcome::Interrupted);
    }

    #[tokio::test]
    async fn model_failure_marks_error_and_reports_in_band() {
        let model = Arc::new(MockModelClient::from_fn(|request| match phase_of(request) {
            "decompose" => MockResponse::text("<task_item>a</task_item>"),
            "execute" => MockResponse::Error {
                status: 400,
                message: "bad request".into(),
            },
            _ => MockResponse::text("ok"),
        }));
        let persister = Arc::new(CountingPersister::default());
        let orch = orchestrator(model, persister.clone(), OrchestratorConfig::default());

        let (messages, outcome) = orch.run_stream(RunRequest::user("x")).await.unwrap().collect().await;

        assert_matches!(outcome, RunOutcome::Failed { ref category, .. } if category == "upstream");
        let report = messages.iter().find(|m| m.kind == MessageType::Error).unwrap();
        assert!(report.content_str().contains("bad request"));
        assert_eq!(persister.last().status, SessionStatus::Error);
        assert_eq!(persister.saves(), 1);
    }

    #[tokio::test]
    async fn need_user_input_asks_for_clarification() {
        let model = Arc::new(MockModelClient::from_fn(|request| match phase_of(request) {
            "decompose" => MockResponse::text("<task_item>book a flight</task_item>"),
            "observe" => MockResponse::text(
                "<analysis>Which city are you flying from?</analysis>\
                 <completion_status>need_user_input</completion_status>",
            ),
            _ => MockResponse::text("ok"),
        }));
        let orch = orchestrator(model, Arc::new(CountingPersister::default()), OrchestratorConfig::default());

        let (messages, outcome) = orch.run_stream(RunRequest::user("book it")).await.unwrap().collect().await;

        assert_eq!(outcome, RunOutcome::NeedsUserInput);
        let answers: Vec<_> = messages
            .iter()
            .filter(|m| m.kind == MessageType::FinalAnswer && m.is_final)
            .collect();
        assert!(answers[0].content_str().contains("Which city are you flying from?"));
    }

    #[tokio::test]
    async fn empty_decomposition_falls_back_to_request() {
        let model = Arc::new(MockModelClient::from_fn(|request| match phase_of(request) {
            "decompose" => MockResponse::text("I cannot split this."),
            "observe" => observation("completed", r#"["1"]"#),
            _ => MockResponse::text("ok"),
        }));
        let persister = Arc::new(CountingPersister::default());
        let orch = orchestrator(model, persister.clone(), OrchestratorConfig::default());

        let (_, outcome) = orch.run_stream(RunRequest::user("say hi")).await.unwrap().collect().await;

        assert_eq!(outcome, RunOutcome::Completed);
        let tasks = persister.last().tasks;
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].description, "say hi");
    }

    #[tokio::test]
    async fn parallel_subtasks_record_results() {
        let model = Arc::new(MockModelClient::from_fn(|request| match phase_of(request) {
            "decompose" => MockResponse::text(
                "<task_item>square 2</task_item><task_item>square 3</task_item><task_item>square 4</task_item>",
            ),
            "subtask" => {
                let prompt = &request.system_prompt;
                let n: u32 = prompt
                    .rsplit("square ")
                    .next()
                    .and_then(|rest| rest.trim().split_whitespace().next())
                    .and_then(|d| d.parse().ok())
                    .unwrap_or(0);
                MockResponse::text(format!("{}", n * n))
            }
            "observe" => observation("completed", r#"["1", "2", "3"]"#),
            _ => MockResponse::text("ok"),
        }));
        let persister = Arc::new(CountingPersister::default());
        let config = OrchestratorConfig {
            parallel_subtasks: true,
            max_parallel: 2,
            ..OrchestratorConfig::default()
        };
        let orch = orchestrator(model.clone(), persister.clone(), config);

        let (messages, outcome) = orch.run_stream(RunRequest::user("squares")).await.unwrap().collect().await;

        assert_eq!(outcome, RunOutcome::Completed);
        let results: Vec<_> = messages
            .iter()
            .filter(|m| m.kind == MessageType::DoSubtaskResult)
            .collect();
        assert_eq!(results.len(), 3);
        assert!(results[0].content_str().starts_with("[1] square 2"));
        assert_eq!(phases(&model).iter().filter(|p| **p == "subtask").count(), 3);
        assert!(!phases(&model).contains(&"execute"));

        let tasks = persister.last().tasks;
        let squares: Vec<_> = tasks.iter().map(|t| t.result.clone().unwrap()).collect();
        assert_eq!(squares, vec!["4", "9", "16"]);
        let history = persister.last().messages;
        assert!(history.iter().all(|m| m.kind != MessageType::Execution));
    }
}
