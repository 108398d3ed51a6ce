//! Request files accepted by `sage run`.

use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::Deserialize;

use sage_core::{Message, SessionId};
use sage_runtime::RunRequest;

/// On-disk request: either a plain `query` or full `messages`.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RequestFile {
    /// Session to continue.
    pub session_id: Option<String>,
    /// Shorthand for a single user message.
    pub query: Option<String>,
    /// Messages to append, in order.
    pub messages: Vec<Message>,
    /// Iteration ceiling override.
    pub max_loop_count: Option<usize>,
}

impl RequestFile {
    /// Read and parse `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read request file: {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("invalid request file: {}", path.display()))
    }

    /// Build the run request. Command-line values win over the file.
    pub fn into_request(self, session_id: Option<String>, max_loop_count: Option<usize>) -> Result<RunRequest> {
        let mut messages = self.messages;
        if let Some(query) = self.query.filter(|q| !q.trim().is_empty()) {
            messages.push(Message::user(query));
        }
        if messages.is_empty() {
            bail!("request has neither `query` nor `messages`");
        }
        Ok(RunRequest {
            session_id: session_id.or(self.session_id).map(SessionId::from),
            messages,
            max_loop_count: max_loop_count.or(self.max_loop_count),
        })
    }
}
