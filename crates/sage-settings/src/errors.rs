//! Settings errors.

use thiserror::Error;

/// Why settings could not be produced.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// `settings.json` exists but could not be read.
    #[error("cannot read settings: {0}")]
    Io(#[from] std::io::Error),
    /// `settings.json` is not valid JSON or does not match the schema.
    #[error("malformed settings: {0}")]
    Json(#[from] serde_json::Error),
    /// Loaded fine, but a value would break the orchestrator.
    #[error("invalid settings value: {0}")]
    InvalidValue(String),
}

impl SettingsError {
    /// Category string carried in logs.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Io(_) | Self::Json(_) | Self::InvalidValue(_) => "config",
        }
    }
}

/// Settings result.
pub type Result<T> = std::result::Result<T, SettingsError>;
