//! Store error types.

/// Errors raised by the store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// `SQLite` failure.
    #[error("database error: {0}")]
    Database(String),

    /// A stored row could not be decoded.
    #[error("corrupt row: {0}")]
    CorruptRow(String),

    /// JSON encoding or decoding failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Filesystem failure.
    #[error("IO error: {0}")]
    Io(String),
}

impl StoreError {
    /// Category string carried in logs. Undecodable rows are `malformed`.
    pub fn category(&self) -> &'static str {
        match self {
            Self::CorruptRow(_) | Self::Serialization(_) => "malformed",
            Self::Database(_) | Self::Io(_) => "persistence",
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<StoreError> for sage_core::PersistenceError {
    fn from(e: StoreError) -> Self {
        sage_core::PersistenceError::new("store", e.to_string())
    }
}
