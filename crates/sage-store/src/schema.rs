//! SQL DDL for the sage-store database.

/// Current schema version.
pub const SCHEMA_VERSION: u32 = 1;

/// Tables and indexes.
pub const CREATE_TABLES: &str = r"
CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    status TEXT NOT NULL,
    messages TEXT NOT NULL,
    tasks TEXT NOT NULL,
    task_history TEXT NOT NULL,
    audit_state TEXT NOT NULL,
    message_count INTEGER NOT NULL DEFAULT 0,
    task_count INTEGER NOT NULL DEFAULT 0,
    saved_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS lock_leases (
    key TEXT PRIMARY KEY,
    owner TEXT NOT NULL,
    expires_at_ms INTEGER NOT NULL,
    acquired_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sessions_status ON sessions(status);
CREATE INDEX IF NOT EXISTS idx_sessions_saved_at ON sessions(saved_at);

CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL
);
";

/// Connection pragmas.
pub const PRAGMAS: &str = r"
PRAGMA journal_mode = WAL;
PRAGMA busy_timeout = 5000;
PRAGMA synchronous = NORMAL;
";
