//! Context error types.

use thiserror::Error;

/// Errors raised while assembling a model call's context.
#[derive(Debug, Error)]
pub enum ContextError {
    /// The fixed prefix alone does not fit in the model's context window.
    #[error("configuration exceeds model length: fixed prefix costs {fixed_cost_tokens} tokens, model allows {max_model_len}")]
    PrefixExceedsModelLength {
        /// Estimated prefix cost.
        fixed_cost_tokens: usize,
        /// Model context length.
        max_model_len: usize,
    },
}
