//! Output formats of the decomposer and the observer.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use sage_context::tag_stream::{extract_all, extract_tag};

/// Observer verdict on the run as a whole.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionStatus {
    /// Keep iterating.
    #[default]
    InProgress,
    /// Everything the user asked for is done.
    Completed,
    /// The run cannot proceed without the user.
    NeedUserInput,
    /// The run cannot succeed.
    Failed,
}

impl CompletionStatus {
    /// Whether the loop should stop after this observation.
    pub fn ends_loop(self) -> bool {
        self != Self::InProgress
    }
}

impl FromStr for CompletionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "need_user_input" => Ok(Self::NeedUserInput),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown completion status: {other}")),
        }
    }
}

/// Structured result of one observe phase.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    /// Free-text analysis shown to the user.
    pub analysis: String,
    /// Observer's estimate of overall progress, 0 to 100.
    pub finish_percent: Option<u8>,
    /// Verdict on the run.
    pub completion_status: CompletionStatus,
    /// Tasks the observer considers finished.
    pub completed_task_ids: Vec<String>,
    /// Tasks still open.
    pub pending_task_ids: Vec<String>,
    /// Tasks that cannot be finished.
    pub failed_task_ids: Vec<String>,
}

impl Observation {
    /// Parse observer output. Missing or malformed parts fall back to
    /// "in progress, nothing changed".
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn parse(text: &str) -> Self {
        let completion_status = match extract_tag(text, "completion_status") {
            Some(raw) => raw.parse().unwrap_or_else(|err: String| {
                warn!(error = %err, "treating observation as in progress");
                CompletionStatus::InProgress
            }),
            None => CompletionStatus::InProgress,
        };
        let finish_percent = extract_tag(text, "finish_percent").and_then(|raw| {
            raw.trim()
                .trim_end_matches('%')
                .trim()
                .parse::<f64>()
                .ok()
                .map(|p| p.clamp(0.0, 100.0).round() as u8)
        });

        Self {
            analysis: extract_tag(text, "analysis").map(|a| a.trim().to_owned()).unwrap_or_default(),
            finish_percent,
            completion_status,
            completed_task_ids: parse_ids(text, "completed_task_ids"),
            pending_task_ids: parse_ids(text, "pending_task_ids"),
            failed_task_ids: parse_ids(text, "failed_task_ids"),
        }
    }
}

/// Ids listed as a JSON array of strings or numbers inside `<tag>`.
fn parse_ids(text: &str, tag: &str) -> Vec<String> {
    let Some(raw) = extract_tag(text, tag) else {
        return Vec::new();
    };
    let raw = raw.trim();
    if raw.is_empty() {
        return Vec::new();
    }
    match serde_json::from_str::<Vec<Value>>(raw) {
        Ok(values) => values
            .into_iter()
            .filter_map(|v| match v {
                Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_owned()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .collect(),
        Err(err) => {
            warn!(tag, error = %err, "malformed task id list, ignoring");
            Vec::new()
        }
    }
}

/// Task descriptions from decomposer output, one per `<task_item>`.
pub fn parse_task_items(text: &str) -> Vec<String> {
    extract_all(text, "task_item")
        .into_iter()
        .map(|item| item.trim().to_owned())
        .filter(|item| !item.is_empty())
        .collect()
}
