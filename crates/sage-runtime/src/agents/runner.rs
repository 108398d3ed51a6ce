//! One sub-agent phase: budget the prompt, stream the model, run tools.

use std::sync::Arc;

use futures::StreamExt;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use sage_context::{TagEvent, TagStreamParser, assemble_context};
use sage_core::model::{ModelClient, ModelRequest, TokenUsage, ToolCallDelta};
use sage_core::tools::{ToolContext, ToolProvider};
use sage_core::{Message, MessageId, MessageType, ToolCall, ToolError};

use super::Phase;
use super::emitter::Emitter;
use crate::errors::RuntimeError;
use crate::session::AUDIT_BUDGET;

/// What a phase produced.
#[derive(Clone, Debug, Default)]
pub struct PhaseOutput {
    /// Concatenated assistant text of every round.
    pub text: String,
    /// Usage summed over every round.
    pub usage: TokenUsage,
    /// Tool calls executed.
    pub tool_calls: usize,
}

/// Runs phases against a model and a tool provider.
#[derive(Clone)]
pub struct PhaseRunner {
    model: Arc<dyn ModelClient>,
    tools: Arc<dyn ToolProvider>,
    max_tool_rounds: usize,
    temperature: Option<f32>,
}

/// Streams of the current model turn, each under its own message id.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Lane {
    Text,
    Thinking,
    Calls,
}

/// Message ids for one model turn. Fragments of one id must stay
/// contiguous, so returning to a lane after another lane was used opens a
/// new message.
struct LaneIds {
    text: MessageId,
    thinking: MessageId,
    calls: MessageId,
    last: Option<Lane>,
    used: [bool; 3],
}

impl LaneIds {
    fn new() -> Self {
        Self {
            text: MessageId::new(),
            thinking: MessageId::new(),
            calls: MessageId::new(),
            last: None,
            used: [false; 3],
        }
    }

    /// Id of the message `lane` last wrote to, without opening a new one.
    fn current(&self, lane: Lane) -> MessageId {
        match lane {
            Lane::Text => self.text.clone(),
            Lane::Thinking => self.thinking.clone(),
            Lane::Calls => self.calls.clone(),
        }
    }

    fn id(&mut self, lane: Lane) -> MessageId {
        let slot = lane as usize;
        if self.used[slot] && self.last != Some(lane) {
            let fresh = MessageId::new();
            match lane {
                Lane::Text => self.text = fresh,
                Lane::Thinking => self.thinking = fresh,
                Lane::Calls => self.calls = fresh,
            }
        }
        self.used[slot] = true;
        self.last = Some(lane);
        self.current(lane)
    }
}

/// Result of a single streamed model turn.
#[derive(Default)]
struct Turn {
    text: String,
    calls: Vec<ToolCall>,
    usage: TokenUsage,
}

/// User-visible part of a batch of tag events.
fn visible_text(phase: Phase, events: &[TagEvent]) -> Option<String> {
    let tag = phase.visible_tag()?;
    let mut shown = String::new();
    for event in events {
        match event {
            TagEvent::Text { tag: Some(t), text } if t == tag => shown.push_str(text),
            TagEvent::Close(t) if t == tag => shown.push('\n'),
            _ => {}
        }
    }
    Some(shown)
}

/// Empty final fragment that ends the text message `id`.
fn closing_fragment(id: MessageId, phase: Phase, tail: Option<String>) -> Message {
    let closing = Message::assistant(id, phase.message_type(), "")
        .with_agent(phase.agent_name())
        .finished();
    match tail.filter(|t| !t.is_empty()) {
        Some(tail) => closing.with_show_content(tail),
        None => closing,
    }
}

/// Fold one tool-call delta into `calls`, returning the fragment to emit.
fn absorb_call_delta(calls: &mut Vec<(usize, ToolCall)>, delta: ToolCallDelta) -> ToolCall {
    let id = match delta.id.filter(|id| !id.is_empty()) {
        Some(id) => id,
        None => calls
            .iter()
            .rev()
            .find(|(index, _)| *index == delta.index)
            .map_or_else(|| format!("call_{}", delta.index), |(_, c)| c.id.clone()),
    };
    let fragment = ToolCall::new(
        id,
        delta.name.unwrap_or_default(),
        delta.arguments.unwrap_or_default(),
    );
    match calls.iter_mut().find(|(_, c)| c.id == fragment.id) {
        Some((_, existing)) => existing.absorb(&fragment),
        None => calls.push((delta.index, fragment.clone())),
    }
    fragment
}

impl PhaseRunner {
    /// Runner allowing up to `max_tool_rounds` tool round trips per phase.
    pub fn new(model: Arc<dyn ModelClient>, tools: Arc<dyn ToolProvider>, max_tool_rounds: usize) -> Self {
        Self {
            model,
            tools,
            max_tool_rounds,
            temperature: None,
        }
    }

    /// Override the sampling temperature sent with each call.
    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Tool provider used by execute phases.
    pub fn tools(&self) -> &Arc<dyn ToolProvider> {
        &self.tools
    }

    /// Run `phase` with `system_prompt` against the emitter's session.
    ///
    /// Every produced fragment is merged into the session and forwarded
    /// before the next one is read. Returns `Cancelled` as soon as the
    /// session is interrupted.
    #[instrument(skip_all, fields(phase = %phase, session_id = %emitter.session().id()))]
    pub async fn run(
        &self,
        phase: Phase,
        system_prompt: &str,
        emitter: &Emitter,
    ) -> Result<PhaseOutput, RuntimeError> {
        let session = emitter.session();
        let cancel = session.cancel_token();
        let tools = if phase.uses_tools() {
            self.tools.tool_specs()
        } else {
            Vec::new()
        };
        let mut output = PhaseOutput::default();
        let mut rounds = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(RuntimeError::Cancelled);
            }
            let assembled = assemble_context(
                system_prompt,
                &session.messages(),
                &session.last_user_query(),
                session.budget_config(),
            )?;
            session.set_audit(
                AUDIT_BUDGET,
                serde_json::to_value(assembled.budget).unwrap_or(Value::Null),
            );

            let request = ModelRequest {
                system_prompt: system_prompt.to_owned(),
                messages: assembled.messages,
                tools: tools.clone(),
                max_tokens: u32::try_from(assembled.budget.new_output_budget).ok(),
                temperature: self.temperature,
            };
            let turn = self.stream_turn(phase, request, emitter, &cancel).await?;
            output.text.push_str(&turn.text);
            output.usage.accumulate(&turn.usage);

            if turn.calls.is_empty() {
                return Ok(output);
            }
            if !phase.uses_tools() {
                warn!(calls = turn.calls.len(), "ignoring tool calls outside execute");
                return Ok(output);
            }
            if rounds >= self.max_tool_rounds {
                warn!(rounds, "tool round limit reached");
                return Ok(output);
            }
            rounds += 1;

            for call in &turn.calls {
                if cancel.is_cancelled() {
                    return Err(RuntimeError::Cancelled);
                }
                self.run_tool_call(phase, call, emitter, &cancel).await?;
                output.tool_calls += 1;
            }
        }
    }

    async fn stream_turn(
        &self,
        phase: Phase,
        request: ModelRequest,
        emitter: &Emitter,
        cancel: &CancellationToken,
    ) -> Result<Turn, RuntimeError> {
        let agent = phase.agent_name();
        let mut stream = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(RuntimeError::Cancelled),
            stream = self.model.stream(request) => stream?,
        };

        let mut ids = LaneIds::new();
        let mut parser = TagStreamParser::new();
        let mut calls: Vec<(usize, ToolCall)> = Vec::new();
        let mut turn = Turn::default();
        let mut saw_usage = false;
        // The text message must be finished while it is still the last one.
        let mut text_open = false;

        loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(RuntimeError::Cancelled),
                next = stream.next() => next,
            };
            let Some(delta) = next else {
                break;
            };
            let delta = delta?;

            if let Some(reasoning) = delta.reasoning_content.filter(|r| !r.is_empty()) {
                if std::mem::take(&mut text_open) {
                    emitter.emit(closing_fragment(ids.current(Lane::Text), phase, None)).await?;
                }
                let fragment = Message::assistant(ids.id(Lane::Thinking), MessageType::Thinking, reasoning)
                    .with_agent(agent)
                    .chunk();
                emitter.emit(fragment).await?;
            }

            if let Some(text) = delta.content.filter(|t| !t.is_empty()) {
                let events = parser.push_str(&text);
                let mut fragment = Message::assistant(ids.id(Lane::Text), phase.message_type(), text.as_str())
                    .with_agent(agent)
                    .chunk();
                if let Some(shown) = visible_text(phase, &events).filter(|s| !s.is_empty()) {
                    fragment = fragment.with_show_content(shown);
                }
                turn.text.push_str(&text);
                text_open = true;
                emitter.emit(fragment).await?;
            }

            if !delta.tool_calls.is_empty() && std::mem::take(&mut text_open) {
                emitter.emit(closing_fragment(ids.current(Lane::Text), phase, None)).await?;
            }
            for call_delta in delta.tool_calls {
                let fragment = absorb_call_delta(&mut calls, call_delta);
                let message = Message::assistant_tool_calls(ids.id(Lane::Calls), vec![fragment])
                    .with_agent(agent)
                    .chunk();
                emitter.emit(message).await?;
            }

            if let Some(usage) = delta.usage {
                saw_usage = true;
                turn.usage.accumulate(&usage);
            }
        }

        let tail = visible_text(phase, &parser.finish());
        if text_open {
            emitter.emit(closing_fragment(ids.current(Lane::Text), phase, tail)).await?;
        } else if tail.is_some_and(|t| !t.is_empty()) {
            debug!("dropping shown tail after the text message was closed");
        }

        if saw_usage {
            let session = emitter.session();
            session.record_usage(phase.as_str(), &turn.usage);
            let report = json!({ "phase": phase.as_str(), "usage": turn.usage });
            let message = Message::assistant(MessageId::new(), MessageType::TokenUsage, report.to_string())
                .with_agent(agent);
            emitter.emit_transient(message).await?;
        }

        turn.calls = calls.into_iter().map(|(_, c)| c).collect();
        debug!(
            text_len = turn.text.len(),
            calls = turn.calls.len(),
            total_tokens = turn.usage.total_tokens,
            "model turn finished"
        );
        Ok(turn)
    }

    async fn run_tool_call(
        &self,
        phase: Phase,
        call: &ToolCall,
        emitter: &Emitter,
        cancel: &CancellationToken,
    ) -> Result<(), RuntimeError> {
        let agent = phase.agent_name();
        let name = call.function.name.as_str();
        let args = call.parse_arguments().unwrap_or_else(|err| {
            warn!(tool = name, error = %err, "malformed tool arguments, calling with {{}}");
            Value::Object(serde_json::Map::new())
        });
        let ctx = ToolContext {
            session_id: emitter.session().id().clone(),
            agent_name: agent.to_owned(),
            cancel: cancel.clone(),
        };

        debug!(tool = name, call_id = %call.id, "running tool");
        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(RuntimeError::Cancelled),
            result = self.tools.run_tool(name, &ctx, args) => result,
        };

        let result_id = MessageId::new();
        match result {
            Ok(output) => {
                let mut texts = output.into_texts();
                if texts.is_empty() {
                    texts.push(String::new());
                }
                for text in texts {
                    let fragment = Message::tool_result(result_id.clone(), call.id.as_str(), text)
                        .with_agent(agent)
                        .chunk();
                    emitter.emit(fragment).await?;
                }
                Ok(())
            }
            Err(ToolError::Cancelled) => Err(RuntimeError::Cancelled),
            Err(err) => {
                warn!(tool = name, error = %err, "tool failed");
                let fragment = Message::tool_result(result_id, call.id.as_str(), format!("Error: {err}"))
                    .with_agent(agent)
                    .finished();
                emitter.emit(fragment).await?;
                Err(err.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use sage_context::BudgetConfig;
    use sage_core::tools::ToolOutput;
    use sage_core::model::ModelDelta;
    use sage_core::{Role, SessionId};
    use sage_llm::{MockModelClient, MockResponse};
    use std::time::Duration;
    use tokio::sync::mpsc;

    use crate::session::{AUDIT_TOKEN_USAGE, SessionContext};

    struct Echo;

    #[async_trait]
    impl ToolProvider for Echo {
        fn tool_names(&self) -> Vec<String> {
            vec!["echo".into(), "boom".into()]
        }

        async fn run_tool(&self, name: &str, _ctx: &ToolContext, args: Value) -> Result<ToolOutput, ToolError> {
            match name {
                "echo" => Ok(ToolOutput::Value(args)),
                "boom" => Err(ToolError::Execution {
                    name: name.into(),
                    message: "exploded".into(),
                }),
                other => Err(ToolError::NotFound { name: other.into() }),
            }
        }
    }

    fn session() -> Arc<SessionContext> {
        let ctx = Arc::new(SessionContext::new(SessionId::from("s1"), BudgetConfig::default()));
        let _ = ctx.begin_run();
        let _ = ctx.add_messages([Message::user("find 2 primes under 10")]);
        ctx
    }

    fn runner(model: MockModelClient) -> PhaseRunner {
        PhaseRunner::new(Arc::new(model), Arc::new(Echo), 2)
    }

    #[tokio::test]
    async fn text_phase_merges_into_one_message() {
        let ctx = session();
        let (tx, mut rx) = mpsc::channel(64);
        let emitter = Emitter::new(ctx.clone(), tx);
        let model = MockModelClient::scripted(vec![MockResponse::text("Step one: list primes.")]);

        let out = runner(model).run(Phase::Plan, "plan", &emitter).await.unwrap();

        assert_eq!(out.text, "Step one: list primes.");
        let messages = ctx.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].content_str(), "Step one: list primes.");
        assert_eq!(messages[1].kind, MessageType::Planning);
        assert_eq!(messages[1].agent_name.as_deref(), Some("planner"));
        assert!(messages[1].is_final);

        let mut kinds = Vec::new();
        while let Ok(m) = rx.try_recv() {
            kinds.push(m.kind);
        }
        assert_eq!(kinds.last(), Some(&MessageType::TokenUsage));
        assert!(ctx.audit(AUDIT_TOKEN_USAGE).unwrap()["by_phase"]["plan"]["total_tokens"].as_u64().unwrap() > 0);
        assert!(ctx.audit(AUDIT_BUDGET).is_some());
    }

    #[tokio::test]
    async fn decompose_shows_only_task_items() {
        let ctx = session();
        let emitter = Emitter::detached(ctx.clone());
        let model = MockModelClient::scripted(vec![MockResponse::text(
            "Thinking... <task_item>list primes</task_item><task_item>pick two</task_item>",
        )])
        .with_chunk_chars(5);

        let _ = runner(model).run(Phase::Decompose, "decompose", &emitter).await.unwrap();

        let last = ctx.messages().pop().unwrap();
        assert_eq!(last.show_content.as_deref(), Some("list primes\npick two\n"));
        assert!(last.content_str().starts_with("Thinking..."));
    }

    #[tokio::test]
    async fn execute_runs_tools_then_answers() {
        let ctx = session();
        let emitter = Emitter::detached(ctx.clone());
        let model = MockModelClient::scripted(vec![
            MockResponse::tool_call("call_1", "echo", json!({"n": 7})),
            MockResponse::text("7 is prime"),
        ]);

        let out = runner(model).run(Phase::Execute, "execute", &emitter).await.unwrap();

        assert_eq!(out.tool_calls, 1);
        assert_eq!(out.text, "7 is prime");
        let messages = ctx.messages();
        let call_msg = messages.iter().find(|m| m.kind == MessageType::ToolCall).unwrap();
        let calls = call_msg.tool_calls.as_ref().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].function.name, "echo");
        assert_eq!(calls[0].parse_arguments().unwrap(), json!({"n": 7}));
        let result = messages.iter().find(|m| m.role == Role::Tool).unwrap();
        assert_eq!(result.tool_call_id.as_deref(), Some("call_1"));
        assert_eq!(result.content_str(), r#"{"n":7}"#);
    }

    #[tokio::test]
    async fn tool_failure_is_reported_then_raised() {
        let ctx = session();
        let emitter = Emitter::detached(ctx.clone());
        let model = MockModelClient::scripted(vec![MockResponse::tool_call("c", "boom", json!({}))]);

        let err = runner(model).run(Phase::Execute, "execute", &emitter).await.unwrap_err();

        assert_matches!(err, RuntimeError::Tool(ToolError::Execution { .. }));
        let result = ctx.messages().into_iter().find(|m| m.role == Role::Tool).unwrap();
        assert!(result.content_str().contains("exploded"));
    }

    #[tokio::test]
    async fn malformed_arguments_call_with_empty_object() {
        let ctx = session();
        let emitter = Emitter::detached(ctx.clone());
        let model = MockModelClient::scripted(vec![
            MockResponse::ToolCalls(vec![ToolCall::new("c", "echo", "{not json")]),
            MockResponse::text("done"),
        ]);

        let _ = runner(model).run(Phase::Execute, "execute", &emitter).await.unwrap();

        let result = ctx.messages().into_iter().find(|m| m.role == Role::Tool).unwrap();
        assert_eq!(result.content_str(), "{}");
    }

    #[tokio::test]
    async fn tool_rounds_are_capped() {
        let ctx = session();
        let emitter = Emitter::detached(ctx.clone());
        let model = MockModelClient::from_fn(|_| MockResponse::tool_call("c", "echo", json!({})));
        let model = Arc::new(model);
        let runner = PhaseRunner::new(model.clone(), Arc::new(Echo), 2);

        let out = runner.run(Phase::Execute, "execute", &emitter).await.unwrap();

        assert_eq!(out.tool_calls, 2);
        assert_eq!(model.call_count(), 3);
    }

    #[tokio::test]
    async fn non_execute_phase_ignores_tool_calls() {
        let ctx = session();
        let emitter = Emitter::detached(ctx.clone());
        let model = MockModelClient::scripted(vec![MockResponse::tool_call("c", "echo", json!({}))]);

        let out = runner(model).run(Phase::Plan, "plan", &emitter).await.unwrap();

        assert_eq!(out.tool_calls, 0);
        assert!(ctx.messages().iter().all(|m| m.role != Role::Tool));
    }

    #[tokio::test]
    async fn model_error_propagates() {
        let ctx = session();
        let emitter = Emitter::detached(ctx.clone());
        let model = MockModelClient::scripted(vec![MockResponse::Error {
            status: 500,
            message: "down".into(),
        }]);

        let err = runner(model).run(Phase::Plan, "plan", &emitter).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn oversized_prompt_is_a_context_error() {
        let ctx = Arc::new(SessionContext::new(
            SessionId::from("s1"),
            BudgetConfig {
                max_model_len: 10,
                ..BudgetConfig::default()
            },
        ));
        let _ = ctx.begin_run();
        let emitter = Emitter::detached(ctx.clone());
        let model = MockModelClient::scripted(vec![MockResponse::text("unused")]);

        let err = runner(model)
            .run(Phase::Plan, &"long prompt ".repeat(50), &emitter)
            .await
            .unwrap_err();
        assert_matches!(err, RuntimeError::Context(_));
    }

    #[tokio::test(start_paused = true)]
    async fn interrupt_stops_streaming() {
        let ctx = session();
        let emitter = Emitter::detached(ctx.clone());
        let model = MockModelClient::scripted(vec![MockResponse::text("a long answer that streams slowly")])
            .with_chunk_chars(2)
            .with_chunk_delay(Duration::from_millis(50));
        let runner = runner(model);

        let interrupter = {
            let ctx = ctx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(120)).await;
                ctx.interrupt();
            })
        };
        let err = runner.run(Phase::Execute, "execute", &emitter).await.unwrap_err();
        interrupter.await.unwrap();

        assert!(err.is_cancellation());
        let partial = ctx.messages().pop().unwrap();
        assert!(partial.content_str().len() < "a long answer that streams slowly".len());
    }

    #[tokio::test]
    async fn text_before_tool_call_is_closed_in_place() {
        let ctx = session();
        let emitter = Emitter::detached(ctx.clone());
        let call = ToolCallDelta {
            index: 0,
            id: Some("c1".into()),
            name: Some("echo".into()),
            arguments: Some("{}".into()),
        };
        let model = MockModelClient::scripted(vec![
            MockResponse::Deltas(vec![
                ModelDelta::text("Let me check."),
                ModelDelta {
                    tool_calls: vec![call],
                    ..ModelDelta::default()
                },
            ]),
            MockResponse::text("checked"),
        ]);

        let _ = runner(model).run(Phase::Execute, "execute", &emitter).await.unwrap();

        let messages = ctx.messages();
        assert!(messages.iter().all(|m| m.tool_calls.is_some() || !m.content_str().is_empty()));
        let text = messages.iter().find(|m| m.content_str() == "Let me check.").unwrap();
        assert!(text.is_final);
        let call_at = messages.iter().position(|m| m.kind == MessageType::ToolCall).unwrap();
        assert_eq!(messages[call_at + 1].role, Role::Tool);
        assert_eq!(messages[call_at + 1].tool_call_id.as_deref(), Some("c1"));
    }

    #[test]
    fn lanes_reopen_after_switch() {
        let mut ids = LaneIds::new();
        let a = ids.id(Lane::Text);
        assert_eq!(ids.id(Lane::Text), a);
        let _ = ids.id(Lane::Calls);
        assert_ne!(ids.id(Lane::Text), a);
    }
}
