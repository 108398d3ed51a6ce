//! Execute fan-out: one isolated sub-session per pending task.

use std::sync::Arc;

use futures::StreamExt;
use tracing::{debug, info, instrument, warn};

use sage_core::{Message, MessageId, MessageType, SessionId, Task};

use crate::agents::{Emitter, Phase, PhaseOutput, PhaseRunner, subtask_prompt};
use crate::errors::RuntimeError;
use crate::session::SessionContext;

/// Run `tasks` in sub-sessions with at most `max_parallel` in flight, then
/// record each result in the parent. Sub-sessions start from a copy of the
/// parent's messages and never write back to them; only the collected
/// results do. The first failure is returned after every result that did
/// succeed has been recorded.
#[instrument(skip_all, fields(session_id = %parent.session().id(), tasks = tasks.len()))]
pub(crate) async fn fan_out(
    runner: &PhaseRunner,
    parent: &Emitter,
    tasks: Vec<Task>,
    max_parallel: usize,
) -> Result<(), RuntimeError> {
    let session = parent.session();
    let cancel = session.cancel_token();
    let base = session.messages();
    let tools = runner.tools().tool_specs();

    let jobs = tasks.into_iter().map(|task| {
        let child_id = SessionId::from(format!("{}-sub-{}", session.id(), task.id));
        let child = Arc::new(SessionContext::child(
            child_id,
            session.budget_config().clone(),
            base.clone(),
            &cancel,
        ));
        let emitter = Emitter::detached(child);
        let prompt = subtask_prompt(&task, &tools);
        async move {
            debug!(task_id = %task.id, "sub-session started");
            let result = runner.run(Phase::Execute, &prompt, &emitter).await;
            (task, result)
        }
    });
    let mut results: Vec<(Task, Result<PhaseOutput, RuntimeError>)> = futures::stream::iter(jobs)
        .buffer_unordered(max_parallel.max(1))
        .collect()
        .await;
    results.sort_by_key(|(task, _)| task.priority);

    let mut first_error = None;
    for (task, result) in results {
        match result {
            Ok(output) => {
                let text = output.text.trim().to_owned();
                let message = Message::assistant(
                    MessageId::new(),
                    MessageType::DoSubtaskResult,
                    format!("[{}] {}\n{}", task.id, task.description, text),
                )
                .with_agent(Phase::Execute.agent_name())
                .finished();
                parent.emit(message).await?;
                session.with_ledger(|l| l.set_result(&task.id, text))?;
            }
            Err(err) if err.is_cancellation() => return Err(err),
            Err(err) => {
                warn!(task_id = %task.id, error = %err, "sub-session failed");
                if first_error.is_none() {
                    first_error = Some(err);
                }
            }
        }
    }

    match first_error {
        Some(err) => Err(err),
        None => {
            info!("sub-sessions finished");
            Ok(())
        }
    }
}
