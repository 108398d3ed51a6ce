//! Streaming model-call boundary.
//!
//! The orchestrator never knows which model or protocol sits behind a
//! [`ModelClient`]; it only consumes a stream of [`ModelDelta`]s. Tool-call
//! deltas arrive keyed by `index` with the id and name usually present only
//! on the first delta of each call.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::ModelError;
use crate::messages::Message;

/// Tool advertised to the model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    /// Tool name.
    pub name: String,
    /// Human description.
    pub description: String,
    /// JSON schema of the arguments.
    pub parameters: Value,
}

/// One model call.
#[derive(Clone, Debug, Default)]
pub struct ModelRequest {
    /// Fixed prefix (instructions) for this call.
    pub system_prompt: String,
    /// Conversation messages after budgeting.
    pub messages: Vec<Message>,
    /// Tools the model may call.
    pub tools: Vec<ToolSpec>,
    /// Output token ceiling.
    pub max_tokens: Option<u32>,
    /// Sampling temperature.
    pub temperature: Option<f32>,
}

/// Partial tool call inside one delta.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallDelta {
    /// Position of the call within the message.
    pub index: usize,
    /// Call id (first delta only, typically).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Function name (first delta only, typically).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Next slice of the argument JSON.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<String>,
}

/// Token accounting reported at the end of a call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Prompt tokens.
    pub prompt_tokens: u64,
    /// Completion tokens.
    pub completion_tokens: u64,
    /// Sum of both.
    pub total_tokens: u64,
}

impl TokenUsage {
    /// Add another usage record into this one.
    pub fn accumulate(&mut self, other: &TokenUsage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}

/// One increment of a streaming response.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelDelta {
    /// Text slice.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Tool-call slices.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallDelta>,
    /// Reasoning slice.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
    /// Terminal usage record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
}

impl ModelDelta {
    /// Text-only delta.
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Self::default()
        }
    }

    /// Usage-only delta.
    pub fn usage(usage: TokenUsage) -> Self {
        Self {
            usage: Some(usage),
            ..Self::default()
        }
    }
}

/// Boxed delta stream returned by [`ModelClient::stream`].
pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<ModelDelta, ModelError>> + Send>>;

/// A streaming language model.
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Short identifier for logs.
    fn name(&self) -> &str;

    /// Start a streaming call.
    async fn stream(&self, request: ModelRequest) -> Result<DeltaStream, ModelError>;
}
