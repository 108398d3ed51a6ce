//! Tools available to `sage run` out of the box.

use async_trait::async_trait;
use serde_json::{Value, json};

use sage_core::ToolError;
use sage_core::model::ToolSpec;
use sage_core::tools::{ToolContext, ToolOutput, ToolProvider};

/// `current_time` and `word_count`.
#[derive(Clone, Copy, Debug, Default)]
pub struct BuiltinTools;

impl BuiltinTools {
    const NAMES: [&'static str; 2] = ["current_time", "word_count"];
}

#[async_trait]
impl ToolProvider for BuiltinTools {
    fn tool_names(&self) -> Vec<String> {
        Self::NAMES.iter().map(|n| (*n).to_owned()).collect()
    }

    fn tool_specs(&self) -> Vec<ToolSpec> {
        vec![
            ToolSpec {
                name: "current_time".into(),
                description: "Current UTC date and time in RFC 3339 format".into(),
                parameters: json!({"type": "object", "properties": {}}),
            },
            ToolSpec {
                name: "word_count".into(),
                description: "Count the words in a piece of text".into(),
                parameters: json!({
                    "type": "object",
                    "properties": {"text": {"type": "string"}},
                    "required": ["text"]
                }),
            },
        ]
    }

    async fn run_tool(&self, name: &str, _ctx: &ToolContext, args: Value) -> Result<ToolOutput, ToolError> {
        match name {
            "current_time" => Ok(ToolOutput::Value(Value::String(chrono::Utc::now().to_rfc3339()))),
            "word_count" => {
                let text = args.get("text").and_then(Value::as_str).ok_or_else(|| ToolError::InvalidArguments {
                    name: name.to_owned(),
                    message: "`text` must be a string".into(),
                })?;
                Ok(ToolOutput::Value(json!({"words": text.split_whitespace().count()})))
            }
            other => Err(ToolError::NotFound { name: other.to_owned() }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sage_core::SessionId;

    fn ctx() -> ToolContext {
        ToolContext {
            session_id: SessionId::from("s"),
            agent_name: "executor".into(),
            cancel: Default::default(),
        }
    }

    #[tokio::test]
    async fn word_count_counts() {
        let out = BuiltinTools.run_tool("word_count", &ctx(), json!({"text": "two primes here"})).await.unwrap();
        assert_eq!(out, ToolOutput::Value(json!({"words": 3})));
    }

    #[tokio::test]
    async fn word_count_requires_text() {
        let err = BuiltinTools.run_tool("word_count", &ctx(), json!({})).await.unwrap_err();
        assert_eq!(err.tool_name(), Some("word_count"));
    }

    #[tokio::test]
    async fn unknown_tool() {
        let err = BuiltinTools.run_tool("nope", &ctx(), json!({})).await.unwrap_err();
        assert!(matches!(err, ToolError::NotFound { .. }));
    }

    #[test]
    fn specs_match_names() {
        let specs: Vec<String> = BuiltinTools.tool_specs().into_iter().map(|s| s.name).collect();
        assert_eq!(specs, BuiltinTools.tool_names());
        assert!(BuiltinTools.has_tool("current_time"));
    }
}
