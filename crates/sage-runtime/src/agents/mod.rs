//! Sub-agents.
//!
//! Every phase of the loop is one LLM-backed sub-agent. They differ only in
//! their instructions, the message type they produce, whether they may call
//! tools, and which tagged part of their output is shown to the user.
//!
//! - **emitter**: Merge fragments into the session and forward them to the caller
//! - **runner**: Budget the prompt, stream the model, run tool rounds
//! - **prompts**: Per-phase instructions built from ledger state
//! - **parse**: Decomposition and observation output formats

mod emitter;
mod parse;
mod prompts;
mod runner;

use sage_core::MessageType;

pub use emitter::Emitter;
pub use parse::{CompletionStatus, Observation, parse_task_items};
pub use prompts::{clarification_text, subtask_prompt, system_prompt};
pub use runner::{PhaseOutput, PhaseRunner};

/// One step of the orchestration loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Split the request into sub-tasks.
    Decompose,
    /// Pick the next concrete step.
    Plan,
    /// Carry the step out, calling tools.
    Execute,
    /// Classify outcomes and update the ledger.
    Observe,
    /// Summarise newly finished tasks.
    StageSummary,
    /// Produce the user-visible answer.
    FinalSummary,
}

impl Phase {
    /// Short name used in logs and audit keys.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Decompose => "decompose",
            Self::Plan => "plan",
            Self::Execute => "execute",
            Self::Observe => "observe",
            Self::StageSummary => "stage_summary",
            Self::FinalSummary => "final_summary",
        }
    }

    /// Name stamped on produced messages.
    pub fn agent_name(self) -> &'static str {
        match self {
            Self::Decompose => "decomposer",
            Self::Plan => "planner",
            Self::Execute => "executor",
            Self::Observe => "observer",
            Self::StageSummary => "stage_summarizer",
            Self::FinalSummary => "summarizer",
        }
    }

    /// Type of the messages this phase produces.
    pub fn message_type(self) -> MessageType {
        match self {
            Self::Decompose => MessageType::TaskDecomposition,
            Self::Plan => MessageType::Planning,
            Self::Execute => MessageType::Execution,
            Self::Observe => MessageType::Observation,
            Self::StageSummary => MessageType::StageSummary,
            Self::FinalSummary => MessageType::FinalAnswer,
        }
    }

    /// Whether tool specs are offered and tool calls executed.
    pub fn uses_tools(self) -> bool {
        self == Self::Execute
    }

    /// Tag whose body is the user-visible part of the output, if any.
    pub fn visible_tag(self) -> Option<&'static str> {
        match self {
            Self::Decompose => Some("task_item"),
            Self::Observe => Some("analysis"),
            Self::Plan | Self::Execute | Self::StageSummary | Self::FinalSummary => None,
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
