//! Wire error types.

use thiserror::Error;

/// Errors raised while encoding or writing the stream.
#[derive(Debug, Error)]
pub enum WireError {
    /// A message could not be serialized.
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    /// The output sink failed.
    #[error("write error: {0}")]
    Io(#[from] std::io::Error),
}

impl WireError {
    /// Error category string.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Serialize(_) => "malformed",
            Self::Io(_) => "internal",
        }
    }
}
