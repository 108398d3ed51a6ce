//! Error types shared across the Sage crates.
//!
//! Each collaborator boundary has its own enum so callers can classify
//! failures without string matching:
//!
//! - [`MessageError`]: a fragment failed structural validation
//! - [`ModelError`]: the streaming model call failed
//! - [`ToolError`]: a tool call failed or was not found
//! - [`PersistenceError`]: saving or loading a session snapshot failed

use thiserror::Error;

/// Structural validation failures for a [`crate::Message`].
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum MessageError {
    /// Every fragment must carry a non-empty message id.
    #[error("message id is required")]
    EmptyId,
    /// `tool` messages must reference the call they answer.
    #[error("tool message {message_id} is missing tool_call_id")]
    MissingToolCallId {
        /// Offending message id.
        message_id: String,
    },
    /// A message must carry content or tool calls.
    #[error("message {message_id} has neither content nor tool_calls")]
    Empty {
        /// Offending message id.
        message_id: String,
    },
}

/// Errors raised by a [`crate::model::ModelClient`].
#[derive(Debug, Error)]
pub enum ModelError {
    /// Transport failure before or during the stream.
    #[error("model transport error: {message}")]
    Transport {
        /// Error description.
        message: String,
        /// Whether a retry could succeed.
        retryable: bool,
    },
    /// The model endpoint answered with an error status.
    #[error("model API error ({status}): {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Error description.
        message: String,
    },
    /// A streamed chunk could not be decoded.
    #[error("model stream parse error: {message}")]
    Parse {
        /// Error description.
        message: String,
    },
    /// The call was cancelled before completion.
    #[error("model call cancelled")]
    Cancelled,
    /// Anything else.
    #[error("{message}")]
    Other {
        /// Error description.
        message: String,
    },
}

impl ModelError {
    /// Whether retrying the call could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { retryable, .. } => *retryable,
            Self::Api { status, .. } => *status == 429 || *status >= 500,
            Self::Parse { .. } | Self::Cancelled | Self::Other { .. } => false,
        }
    }
}

/// Errors raised by a [`crate::tools::ToolProvider`].
#[derive(Debug, Error)]
pub enum ToolError {
    /// No provider knows this tool.
    #[error("tool not found: {name}")]
    NotFound {
        /// Requested tool name.
        name: String,
    },
    /// Arguments were rejected by the tool.
    #[error("invalid arguments for {name}: {message}")]
    InvalidArguments {
        /// Tool name.
        name: String,
        /// Error description.
        message: String,
    },
    /// The tool ran and failed.
    #[error("tool {name} failed: {message}")]
    Execution {
        /// Tool name.
        name: String,
        /// Error description.
        message: String,
    },
    /// The call was cancelled before completion.
    #[error("tool call cancelled")]
    Cancelled,
}

impl ToolError {
    /// Name of the tool involved, if known.
    pub fn tool_name(&self) -> Option<&str> {
        match self {
            Self::NotFound { name }
            | Self::InvalidArguments { name, .. }
            | Self::Execution { name, .. } => Some(name),
            Self::Cancelled => None,
        }
    }
}

/// Failure to save or load a session snapshot.
#[derive(Debug, Error)]
#[error("persistence error during {operation}: {message}")]
pub struct PersistenceError {
    /// Operation that failed (`save`, `load`).
    pub operation: &'static str,
    /// Error description.
    pub message: String,
}

impl PersistenceError {
    /// Build an error for the given operation.
    pub fn new(operation: &'static str, message: impl Into<String>) -> Self {
        Self {
            operation,
            message: message.into(),
        }
    }
}
