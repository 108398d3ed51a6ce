//! Settings loading with deep merge and environment variable overrides.
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::{LockBackendKind, SageSettings};

/// Resolve the Sage home directory (`~/.sage`).
pub fn sage_home() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".sage")
}

/// Resolve the path to the settings file (`~/.sage/settings.json`).
pub fn settings_path() -> PathBuf {
    sage_home().join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<SageSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults; invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<SageSettings> {
    let defaults = serde_json::to_value(SageSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: SageSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `SAGE_*` environment overrides. Invalid values are ignored.
pub fn apply_env_overrides(settings: &mut SageSettings) {
    // ── Budget ──────────────────────────────────────────────────────
    if let Some(v) = read_env_usize("SAGE_MAX_MODEL_LEN", 1, 10_000_000) {
        settings.budget.max_model_len = v;
    }
    if let Some(v) = read_env_usize("SAGE_RECENT_TURNS", 0, 100_000) {
        settings.budget.recent_turns = v;
    }

    // ── Lock ────────────────────────────────────────────────────────
    if let Some(v) = read_env_string("SAGE_LOCK_BACKEND") {
        match parse_lock_backend(&v) {
            Some(kind) => settings.lock.backend = kind,
            None => tracing::warn!(key = "SAGE_LOCK_BACKEND", value = %v, "unknown lock backend, ignoring"),
        }
    }
    if let Some(v) = read_env_u64("SAGE_LOCK_TIMEOUT_SECS", 1, 3600) {
        settings.lock.acquire_timeout_secs = v;
    }

    // ── Orchestration ───────────────────────────────────────────────
    if let Some(v) = read_env_usize("SAGE_MAX_LOOP_COUNT", 1, 1000) {
        settings.orchestration.max_loop_count = v;
    }
    if let Some(v) = read_env_bool("SAGE_PARALLEL_SUBTASKS") {
        settings.orchestration.parallel_subtasks = v;
    }

    // ── Model / store / logging ─────────────────────────────────────
    if let Some(v) = read_env_string("SAGE_MODEL") {
        settings.model.model = v;
    }
    if let Some(v) = read_env_string("SAGE_BASE_URL") {
        settings.model.base_url = v;
    }
    if let Some(v) = read_env_string("SAGE_DB_PATH") {
        settings.store.db_path = v;
    }
    if let Some(v) = read_env_string("SAGE_LOG_LEVEL") {
        settings.logging.level = v;
    }
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `usize` within a range.
pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a lock backend name.
pub fn parse_lock_backend(val: &str) -> Option<LockBackendKind> {
    match val.to_lowercase().as_str() {
        "memory" | "local" => Some(LockBackendKind::Memory),
        "lease" | "distributed" => Some(LockBackendKind::Lease),
        _ => None,
    }
}

// ── Env var readers (thin wrappers) ─────────────────────────────────────────

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn read_env_bool(name: &str) -> Option<bool> {
    let val = std::env::var(name).ok()?;
    let result = parse_bool(&val);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid boolean env var, ignoring");
    }
    result
}

fn read_env_u64(name: &str, min: u64, max: u64) -> Option<u64> {
    let val = std::env::var(name).ok()?;
    let result = parse_u64_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid u64 env var, ignoring");
    }
    result
}

fn read_env_usize(name: &str, min: usize, max: usize) -> Option<usize> {
    let val = std::env::var(name).ok()?;
    let result = parse_usize_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid usize env var, ignoring");
    }
    result
}
