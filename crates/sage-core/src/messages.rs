//! Message model for the orchestrator.
//!
//! A [`Message`] is both the unit of conversation history and the unit of
//! streaming: fragments that share a [`MessageId`] are folded into one
//! logical message by the merger. Role and type are closed enums so an
//! unrecognized value fails at deserialization instead of being ignored.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::MessageError;
use crate::ids::{MessageId, SessionId};

// ─────────────────────────────────────────────────────────────────────────────
// Role / MessageType
// ─────────────────────────────────────────────────────────────────────────────

/// Author of a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// End user.
    User,
    /// Model output (any sub-agent).
    Assistant,
    /// System instructions.
    System,
    /// Tool result.
    Tool,
}

impl Role {
    /// Wire name of the role.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
            Self::Tool => "tool",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Semantic kind of a message, used by clients to decide how to render it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// Plain conversational message.
    #[default]
    Normal,
    /// Rewritten user query.
    Rewrite,
    /// Request analysis.
    TaskAnalysis,
    /// Decomposition into sub-tasks.
    TaskDecomposition,
    /// Next-step plan.
    Planning,
    /// Step execution output.
    Execution,
    /// Outcome classification.
    Observation,
    /// User-visible answer.
    FinalAnswer,
    /// System notice.
    System,
    /// Follow-up suggestions.
    QuerySuggest,
    /// Extracted memories.
    MemoryExtraction,
    /// Routing decision.
    TaskRouter,
    /// Result of a delegated sub-task.
    DoSubtaskResult,
    /// Assistant tool invocation.
    ToolCall,
    /// Tool output.
    ToolCallResult,
    /// Reasoning trace.
    Thinking,
    /// In-band error.
    Error,
    /// Raw chunk.
    Chunk,
    /// Guidance text.
    Guide,
    /// Hand-off between agents.
    HandoffAgent,
    /// Summary of just-finished tasks.
    StageSummary,
    /// Token accounting record (never sent to clients).
    TokenUsage,
}

impl MessageType {
    /// Wire name of the type.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Rewrite => "rewrite",
            Self::TaskAnalysis => "task_analysis",
            Self::TaskDecomposition => "task_decomposition",
            Self::Planning => "planning",
            Self::Execution => "execution",
            Self::Observation => "observation",
            Self::FinalAnswer => "final_answer",
            Self::System => "system",
            Self::QuerySuggest => "query_suggest",
            Self::MemoryExtraction => "memory_extraction",
            Self::TaskRouter => "task_router",
            Self::DoSubtaskResult => "do_subtask_result",
            Self::ToolCall => "tool_call",
            Self::ToolCallResult => "tool_call_result",
            Self::Thinking => "thinking",
            Self::Error => "error",
            Self::Chunk => "chunk",
            Self::Guide => "guide",
            Self::HandoffAgent => "handoff_agent",
            Self::StageSummary => "stage_summary",
            Self::TokenUsage => "token_usage",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tool calls
// ─────────────────────────────────────────────────────────────────────────────

fn default_tool_type() -> String {
    "function".into()
}

/// Function name and raw JSON argument string of a tool call.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionCall {
    /// Tool name. Empty on continuation fragments.
    #[serde(default)]
    pub name: String,
    /// Raw JSON arguments, accumulated across fragments.
    #[serde(default)]
    pub arguments: String,
}

/// A tool call emitted by the assistant.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Tool call id, unique within the message.
    pub id: String,
    /// Call type, always `function` today.
    #[serde(rename = "type", default = "default_tool_type")]
    pub kind: String,
    /// Function payload.
    pub function: FunctionCall,
}

impl ToolCall {
    /// Create a tool call.
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: default_tool_type(),
            function: FunctionCall {
                name: name.into(),
                arguments: arguments.into(),
            },
        }
    }

    /// Fold a later fragment of the same call into this one.
    ///
    /// Arguments are appended; the name is replaced only when the fragment
    /// supplies a non-empty one.
    pub fn absorb(&mut self, fragment: &ToolCall) {
        if !fragment.function.name.is_empty() {
            self.function.name.clone_from(&fragment.function.name);
        }
        self.function.arguments.push_str(&fragment.function.arguments);
    }

    /// Parse the accumulated arguments. Blank arguments parse as `{}`.
    pub fn parse_arguments(&self) -> Result<Value, serde_json::Error> {
        if self.function.arguments.trim().is_empty() {
            return Ok(Value::Object(Map::new()));
        }
        serde_json::from_str(&self.function.arguments)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Message
// ─────────────────────────────────────────────────────────────────────────────

/// One logical message or one fragment of it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Fragment-group id; fragments sharing it are merged.
    #[serde(rename = "message_id")]
    pub id: MessageId,
    /// Author.
    pub role: Role,
    /// Text content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Tool calls issued by the assistant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    /// For `tool` messages, the call being answered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Text intended for display, when it differs from `content`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub show_content: Option<String>,
    /// Semantic kind.
    #[serde(rename = "type", default)]
    pub kind: MessageType,
    /// Transport-only alias of `type`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_type: Option<MessageType>,
    /// Producing sub-agent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
    /// Owning session, when the producer knows it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    /// Creation time.
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    /// Free-form producer metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
    /// Transport flag: last fragment of this id.
    #[serde(default)]
    pub is_final: bool,
    /// Transport flag: this is a partial fragment.
    #[serde(default)]
    pub is_chunk: bool,
}

impl Message {
    /// Bare message with no content.
    pub fn new(id: MessageId, role: Role, kind: MessageType) -> Self {
        Self {
            id,
            role,
            content: None,
            tool_calls: None,
            tool_call_id: None,
            show_content: None,
            kind,
            message_type: None,
            agent_name: None,
            session_id: None,
            timestamp: Utc::now(),
            metadata: None,
            is_final: false,
            is_chunk: false,
        }
    }

    /// User message. User messages are always of the normal type.
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageId::new(), Role::User, MessageType::Normal).with_content(content)
    }

    /// Assistant text message (or fragment) of the given kind.
    pub fn assistant(id: MessageId, kind: MessageType, content: impl Into<String>) -> Self {
        Self::new(id, Role::Assistant, kind).with_content(content)
    }

    /// Assistant message carrying tool calls.
    pub fn assistant_tool_calls(id: MessageId, calls: Vec<ToolCall>) -> Self {
        let mut msg = Self::new(id, Role::Assistant, MessageType::ToolCall);
        msg.tool_calls = Some(calls);
        msg
    }

    /// Tool result answering `tool_call_id`.
    pub fn tool_result(
        id: MessageId,
        tool_call_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        let mut msg = Self::new(id, Role::Tool, MessageType::ToolCallResult).with_content(content);
        msg.tool_call_id = Some(tool_call_id.into());
        msg
    }

    /// Set `content`.
    #[must_use]
    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    /// Set `show_content`.
    #[must_use]
    pub fn with_show_content(mut self, show: impl Into<String>) -> Self {
        self.show_content = Some(show.into());
        self
    }

    /// Set the producing agent.
    #[must_use]
    pub fn with_agent(mut self, agent: impl Into<String>) -> Self {
        self.agent_name = Some(agent.into());
        self
    }

    /// Stamp the owning session.
    #[must_use]
    pub fn with_session(mut self, session_id: SessionId) -> Self {
        self.session_id = Some(session_id);
        self
    }

    /// Mark as a partial fragment.
    #[must_use]
    pub fn chunk(mut self) -> Self {
        self.is_chunk = true;
        self
    }

    /// Mark as the final fragment of its id.
    #[must_use]
    pub fn finished(mut self) -> Self {
        self.is_final = true;
        self
    }

    /// Check structural invariants.
    pub fn validate(&self) -> Result<(), MessageError> {
        if self.id.is_empty() {
            return Err(MessageError::EmptyId);
        }
        if self.role == Role::Tool && self.tool_call_id.as_deref().is_none_or(str::is_empty) {
            return Err(MessageError::MissingToolCallId {
                message_id: self.id.to_string(),
            });
        }
        let has_calls = self.tool_calls.as_ref().is_some_and(|c| !c.is_empty());
        if self.content.is_none() && !has_calls {
            return Err(MessageError::Empty {
                message_id: self.id.to_string(),
            });
        }
        Ok(())
    }

    /// Content as a slice, empty when absent.
    pub fn content_str(&self) -> &str {
        self.content.as_deref().unwrap_or_default()
    }

    /// Whether this message opens a new conversational turn.
    pub fn starts_turn(&self) -> bool {
        self.role == Role::User && self.kind == MessageType::Normal
    }
}
