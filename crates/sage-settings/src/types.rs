//! Settings types.
//!
//! Every section uses `#[serde(default)]`, so a partial settings file only
//! needs the keys it changes.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::errors::{Result, SettingsError};

/// Root settings object.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SageSettings {
    /// Context window partitioning.
    pub budget: BudgetSettings,
    /// Session lock behaviour.
    pub lock: LockSettings,
    /// Loop limits.
    pub orchestration: OrchestrationSettings,
    /// Model endpoint.
    pub model: ModelSettings,
    /// Snapshot database.
    pub store: StoreSettings,
    /// Log output.
    pub logging: LoggingSettings,
}

impl SageSettings {
    /// Reject values that would make the orchestrator misbehave and warn
    /// about ones that are merely suspicious.
    pub fn validate(&self) -> Result<()> {
        if self.orchestration.max_loop_count == 0 {
            return Err(SettingsError::InvalidValue(
                "orchestration.maxLoopCount must be at least 1".into(),
            ));
        }
        if self.orchestration.max_parallel == 0 {
            return Err(SettingsError::InvalidValue(
                "orchestration.maxParallel must be at least 1".into(),
            ));
        }
        let b = &self.budget;
        for (name, ratio) in [
            ("historyRatio", b.history_ratio),
            ("activeRatio", b.active_ratio),
            ("newOutputRatio", b.new_output_ratio),
        ] {
            if !(0.0..=1.0).contains(&ratio) {
                return Err(SettingsError::InvalidValue(format!(
                    "budget.{name} must be within 0.0..=1.0, got {ratio}"
                )));
            }
        }
        let sum = b.history_ratio + b.active_ratio + b.new_output_ratio;
        if (sum - 1.0).abs() > 0.01 {
            warn!(sum, "budget ratios do not sum to 1.0");
        }
        Ok(())
    }
}

/// Context window partitioning.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BudgetSettings {
    /// Model context length in (estimated) tokens.
    pub max_model_len: usize,
    /// Share of the available tokens for retrieved history.
    pub history_ratio: f64,
    /// Share for the verbatim active window.
    pub active_ratio: f64,
    /// Share reserved for model output.
    pub new_output_ratio: f64,
    /// Keep only the most recent N turns (0 = unlimited).
    pub recent_turns: usize,
}

impl Default for BudgetSettings {
    fn default() -> Self {
        Self {
            max_model_len: 60_000,
            history_ratio: 0.2,
            active_ratio: 0.3,
            new_output_ratio: 0.5,
            recent_turns: 0,
        }
    }
}

/// Which lock backend guards sessions.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockBackendKind {
    /// In-process locks.
    #[default]
    Memory,
    /// Expiring leases in the shared database.
    Lease,
}

/// Session lock behaviour.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LockSettings {
    /// Backend selection.
    pub backend: LockBackendKind,
    /// How long `acquire` waits for a lock held by a winding-down run.
    pub acquire_timeout_secs: u64,
    /// Lease length for the lease backend.
    pub lease_secs: u64,
    /// Idle time after which an unheld memory lock is swept.
    pub idle_secs: u64,
    /// Minimum time between two sweeps.
    pub sweep_interval_secs: u64,
    /// Poll interval while waiting for a lease.
    pub poll_interval_ms: u64,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            backend: LockBackendKind::Memory,
            acquire_timeout_secs: 10,
            lease_secs: 30,
            idle_secs: 300,
            sweep_interval_secs: 60,
            poll_interval_ms: 100,
        }
    }
}

/// Loop limits.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OrchestrationSettings {
    /// Maximum plan/execute/observe iterations per run.
    pub max_loop_count: usize,
    /// Maximum model/tool round trips inside one execute phase.
    pub max_tool_rounds: usize,
    /// Delegate pending tasks to parallel sub-sessions.
    pub parallel_subtasks: bool,
    /// Sub-sessions in flight at once.
    pub max_parallel: usize,
}

impl Default for OrchestrationSettings {
    fn default() -> Self {
        Self {
            max_loop_count: 10,
            max_tool_rounds: 8,
            parallel_subtasks: false,
            max_parallel: 3,
        }
    }
}

/// Model endpoint (OpenAI-compatible chat completions).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ModelSettings {
    /// Base URL, without the `/chat/completions` suffix.
    pub base_url: String,
    /// Model name sent with each request.
    pub model: String,
    /// Env var that holds the API key.
    pub api_key_env: String,
    /// Sampling temperature.
    pub temperature: f32,
    /// Whole-request timeout.
    pub request_timeout_secs: u64,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".into(),
            model: "gpt-4o-mini".into(),
            api_key_env: "OPENAI_API_KEY".into(),
            temperature: 0.2,
            request_timeout_secs: 300,
        }
    }
}

/// Snapshot database.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreSettings {
    /// Path to the `SQLite` file. Empty means `~/.sage/sage.db`.
    pub db_path: String,
}

/// Log output.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of compact text.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let settings = SageSettings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.budget.max_model_len, 60_000);
        assert_eq!(settings.lock.lease_secs, 30);
        assert_eq!(settings.orchestration.max_loop_count, 10);
    }

    #[test]
    fn zero_loop_count_rejected() {
        let mut settings = SageSettings::default();
        settings.orchestration.max_loop_count = 0;
        assert!(matches!(settings.validate(), Err(SettingsError::InvalidValue(_))));
    }

    #[test]
    fn out_of_range_ratio_rejected() {
        let mut settings = SageSettings::default();
        settings.budget.active_ratio = 1.5;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn ratio_mismatch_is_not_fatal() {
        let mut settings = SageSettings::default();
        settings.budget.history_ratio = 0.5;
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn serializes_camel_case() {
        let v = serde_json::to_value(SageSettings::default()).unwrap();
        assert_eq!(v["budget"]["maxModelLen"], 60_000);
        assert_eq!(v["lock"]["backend"], "memory");
        assert_eq!(v["orchestration"]["parallelSubtasks"], false);
    }

    #[test]
    fn partial_section_keeps_defaults() {
        let s: SageSettings = serde_json::from_str(r#"{"lock": {"backend": "lease"}}"#).unwrap();
        assert_eq!(s.lock.backend, LockBackendKind::Lease);
        assert_eq!(s.lock.acquire_timeout_secs, 10);
        assert_eq!(s.budget, BudgetSettings::default());
    }
}
