//! The phase loop of one run and its cleanup path.

use std::sync::Arc;

use serde_json::{Value, json};
use tracing::{debug, error, info, instrument, warn};

use sage_core::model::ToolSpec;
use sage_core::{Message, MessageId, MessageType, SessionPersister, SessionStatus, TaskStatus};

use super::RunOutcome;
use super::fanout::fan_out;
use crate::agents::{
    CompletionStatus, Emitter, Observation, Phase, PhaseOutput, PhaseRunner, clarification_text,
    parse_task_items, system_prompt,
};
use crate::errors::RuntimeError;
use crate::lock::LockManager;
use crate::session::{AUDIT_NEEDS_CONTINUATION, AUDIT_OBSERVATIONS, SessionContext, SessionRegistry};

/// Audit key holding the iteration count of the last run.
const AUDIT_ITERATIONS: &str = "iterations";

/// Why the iteration phase stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum LoopExit {
    AllDone,
    Observer(CompletionStatus),
    IterationLimit,
}

/// Everything one run needs, owned by the spawned task.
pub(crate) struct RunLoop {
    pub(crate) session: Arc<SessionContext>,
    pub(crate) emitter: Emitter,
    pub(crate) runner: PhaseRunner,
    pub(crate) registry: Arc<SessionRegistry>,
    pub(crate) locks: LockManager,
    pub(crate) persister: Arc<dyn SessionPersister>,
    pub(crate) max_loop_count: usize,
    pub(crate) parallel_subtasks: bool,
    pub(crate) max_parallel: usize,
}

impl RunLoop {
    /// Run the loop, then clean up. Cleanup runs on every exit path.
    #[instrument(skip_all, fields(session_id = %self.session.id()))]
    pub(crate) async fn drive(self) -> RunOutcome {
        let result = {
            let work = self.run();
            tokio::pin!(work);
            tokio::select! {
                biased;
                result = &mut work => result,
                () = self.emitter.closed() => {
                    info!("caller disconnected, interrupting run");
                    self.session.cancel_token().cancel();
                    work.await
                }
            }
        };

        let (status, outcome) = match result {
            Ok(LoopExit::IterationLimit) => (SessionStatus::Running, RunOutcome::NeedsContinuation),
            Ok(LoopExit::Observer(CompletionStatus::NeedUserInput)) => {
                (SessionStatus::Completed, RunOutcome::NeedsUserInput)
            }
            Ok(LoopExit::AllDone | LoopExit::Observer(_)) => (SessionStatus::Completed, RunOutcome::Completed),
            Err(err) if err.is_cancellation() => (SessionStatus::Interrupted, RunOutcome::Interrupted),
            Err(err) => {
                let category = err.category();
                error!(category, error = %err, "run failed");
                let report = Message::assistant(MessageId::new(), MessageType::Error, format!("[{category}] {err}"))
                    .with_agent("orchestrator")
                    .finished();
                if self.emitter.emit(report).await.is_err() {
                    debug!("error report not delivered, caller is gone");
                }
                (
                    SessionStatus::Error,
                    RunOutcome::Failed {
                        category: category.to_owned(),
                        message: err.to_string(),
                    },
                )
            }
        };

        self.cleanup(status).await;
        info!(?outcome, "run finished");
        outcome
    }

    /// Persist, evict, unlock. Each step logs its own failure and the next
    /// one still runs.
    async fn cleanup(&self, status: SessionStatus) {
        self.session.set_status(status);
        if let Err(err) = self.session.save(self.persister.as_ref()).await {
            error!(error = %err, "failed to persist session");
        }
        let _ = self.registry.evict(self.session.id());
        if let Some(handle) = self.session.take_lock() {
            if let Err(err) = self.locks.release(handle).await {
                warn!(error = %err, "failed to release session lock");
            }
        }
    }

    async fn run(&self) -> Result<LoopExit, RuntimeError> {
        self.session.set_audit(AUDIT_NEEDS_CONTINUATION, Value::Bool(false));
        self.decompose().await?;

        let mut iterations = 0;
        let exit = loop {
            if self.session.with_ledger(|l| l.all_done()) {
                break LoopExit::AllDone;
            }
            if iterations >= self.max_loop_count {
                break LoopExit::IterationLimit;
            }
            iterations += 1;
            debug!(iteration = iterations, "iteration started");
            let completed_before = self.completed_count();

            let _ = self.phase(Phase::Plan).await?;
            self.execute().await?;
            let observation = self.observe().await?;

            if self.completed_count() > completed_before {
                let _ = self.phase(Phase::StageSummary).await?;
            }
            if observation.completion_status.ends_loop() {
                break LoopExit::Observer(observation.completion_status);
            }
        };

        self.session.set_audit(AUDIT_ITERATIONS, json!(iterations));
        if exit == LoopExit::IterationLimit {
            warn!(iterations, "iteration limit reached with work left");
            self.session.set_audit(AUDIT_NEEDS_CONTINUATION, Value::Bool(true));
        }
        if exit == LoopExit::Observer(CompletionStatus::NeedUserInput) {
            self.clarify().await?;
        }

        let _ = self.phase(Phase::FinalSummary).await?;
        Ok(exit)
    }

    fn completed_count(&self) -> usize {
        self.session.with_ledger(|l| l.stats().completed)
    }

    fn tool_specs(&self, phase: Phase) -> Vec<ToolSpec> {
        if matches!(phase, Phase::Plan | Phase::Execute) {
            self.runner.tools().tool_specs()
        } else {
            Vec::new()
        }
    }

    /// Run one phase with its ledger-aware prompt. Stops before starting if
    /// the session was interrupted.
    async fn phase(&self, phase: Phase) -> Result<PhaseOutput, RuntimeError> {
        if self.session.is_interrupted() {
            info!(%phase, "interrupted before phase");
            return Err(RuntimeError::Cancelled);
        }
        let tasks = self.session.with_ledger(|l| l.tasks().to_vec());
        let prompt = system_prompt(phase, &tasks, &self.tool_specs(phase));
        self.runner.run(phase, &prompt, &self.emitter).await
    }

    async fn decompose(&self) -> Result<(), RuntimeError> {
        if self.session.with_ledger(|l| l.has_pending()) {
            info!("resuming with pending tasks, skipping decomposition");
            return Ok(());
        }
        let output = self.phase(Phase::Decompose).await?;
        let mut items = parse_task_items(&output.text);
        if items.is_empty() {
            warn!("decomposition produced no tasks, using the request as the only task");
            items.push(self.session.last_user_query());
        }
        let ids = self.session.with_ledger(|l| l.add_batch(items));
        info!(tasks = ids.len(), "request decomposed");
        Ok(())
    }

    async fn execute(&self) -> Result<(), RuntimeError> {
        let pending: Vec<_> = self
            .session
            .with_ledger(|l| l.by_status(TaskStatus::Pending).into_iter().cloned().collect());
        if self.parallel_subtasks && pending.len() >= 2 {
            if self.session.is_interrupted() {
                return Err(RuntimeError::Cancelled);
            }
            return fan_out(&self.runner, &self.emitter, pending, self.max_parallel).await;
        }
        let _ = self.phase(Phase::Execute).await?;
        Ok(())
    }

    async fn observe(&self) -> Result<Observation, RuntimeError> {
        let output = self.phase(Phase::Observe).await?;
        let observation = Observation::parse(&output.text);
        self.apply_observation(&observation);
        self.session.push_audit(
            AUDIT_OBSERVATIONS,
            serde_json::to_value(&observation).unwrap_or(Value::Null),
        );
        debug!(
            status = ?observation.completion_status,
            finish_percent = ?observation.finish_percent,
            "observation recorded"
        );
        Ok(observation)
    }

    /// Move tasks the observer classified. Unknown ids and backward moves
    /// are skipped.
    fn apply_observation(&self, observation: &Observation) {
        self.session.with_ledger(|ledger| {
            let moves = observation
                .completed_task_ids
                .iter()
                .map(|id| (id, TaskStatus::Completed))
                .chain(observation.failed_task_ids.iter().map(|id| (id, TaskStatus::Failed)));
            for (id, status) in moves {
                if let Err(err) = ledger.update_status(id, status) {
                    warn!(task_id = %id, error = %err, "ignoring observed task update");
                }
            }
        });
    }

    async fn clarify(&self) -> Result<(), RuntimeError> {
        let observation = self
            .session
            .audit(AUDIT_OBSERVATIONS)
            .and_then(|all| all.as_array().and_then(|a| a.last().cloned()))
            .and_then(|last| serde_json::from_value::<Observation>(last).ok())
            .unwrap_or_default();
        let message = Message::assistant(MessageId::new(), MessageType::FinalAnswer, clarification_text(&observation))
            .with_agent(Phase::FinalSummary.agent_name())
            .finished();
        self.emitter.emit(message).await
    }
}
