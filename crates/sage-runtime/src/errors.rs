//! Runtime error types.

use sage_context::ContextError;
use sage_core::{MessageError, ModelError, PersistenceError, ToolError};

use crate::ledger::LedgerError;
use crate::lock::LockError;

/// Errors raised while running a session.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// Session lock could not be taken.
    #[error(transparent)]
    Lock(#[from] LockError),

    /// Ledger rejected an update.
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    /// Prompt could not be budgeted.
    #[error(transparent)]
    Context(#[from] ContextError),

    /// Model call failed.
    #[error(transparent)]
    Model(#[from] ModelError),

    /// Tool call failed.
    #[error(transparent)]
    Tool(#[from] ToolError),

    /// Snapshot could not be saved or loaded.
    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    /// A fragment failed validation.
    #[error("invalid message: {0}")]
    Message(#[from] MessageError),

    /// The run was interrupted or the caller went away.
    #[error("run cancelled")]
    Cancelled,

    /// Internal / unexpected error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl RuntimeError {
    /// Whether the caller may retry the same request.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Lock(e) => e.is_retryable(),
            Self::Model(e) => e.is_retryable(),
            Self::Ledger(_)
            | Self::Context(_)
            | Self::Tool(_)
            | Self::Persistence(_)
            | Self::Message(_)
            | Self::Cancelled
            | Self::Internal(_) => false,
        }
    }

    /// Whether this is a cooperative stop rather than a failure.
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            Self::Cancelled | Self::Model(ModelError::Cancelled) | Self::Tool(ToolError::Cancelled)
        )
    }

    /// Error category string carried by logs and in-band error messages.
    pub fn category(&self) -> &'static str {
        if self.is_cancellation() {
            return "cancelled";
        }
        match self {
            Self::Lock(e) => e.category(),
            Self::Model(_) | Self::Tool(_) => "upstream",
            Self::Ledger(_) | Self::Context(_) | Self::Message(_) => "malformed",
            Self::Persistence(_) => "persistence",
            Self::Cancelled | Self::Internal(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn categories_follow_taxonomy() {
        let conflict: RuntimeError = LockError::Conflict { key: "s".into() }.into();
        assert_eq!(conflict.category(), "conflict");
        assert!(conflict.is_retryable());

        let timeout: RuntimeError = LockError::Timeout {
            key: "s".into(),
            waited: Duration::from_secs(1),
        }
        .into();
        assert_eq!(timeout.category(), "timeout");

        let upstream: RuntimeError = ModelError::Api { status: 500, message: "x".into() }.into();
        assert_eq!(upstream.category(), "upstream");
        assert!(upstream.is_retryable());

        let malformed: RuntimeError = ContextError::PrefixExceedsModelLength {
            fixed_cost_tokens: 10,
            max_model_len: 5,
        }
        .into();
        assert_eq!(malformed.category(), "malformed");
        assert!(!malformed.is_retryable());
    }

    #[test]
    fn cancellation_variants_agree() {
        assert!(RuntimeError::Cancelled.is_cancellation());
        assert!(RuntimeError::from(ToolError::Cancelled).is_cancellation());
        assert_eq!(RuntimeError::from(ModelError::Cancelled).category(), "cancelled");
        assert!(!RuntimeError::Internal("x".into()).is_cancellation());
    }
}
