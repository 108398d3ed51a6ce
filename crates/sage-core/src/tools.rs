//! Tool boundary.
//!
//! The orchestrator only needs one operation from tools: run one by name.
//! Several providers compose through [`CompositeToolProvider`], which asks
//! them in priority order, so call sites never branch on provider type.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::errors::ToolError;
use crate::ids::SessionId;
use crate::model::ToolSpec;

/// Context handed to a tool invocation.
#[derive(Clone, Debug)]
pub struct ToolContext {
    /// Session the call belongs to.
    pub session_id: SessionId,
    /// Sub-agent issuing the call.
    pub agent_name: String,
    /// Fires when the run is interrupted.
    pub cancel: CancellationToken,
}

/// What a tool returned.
#[derive(Clone, Debug, PartialEq)]
pub enum ToolOutput {
    /// A single serializable value.
    Value(Value),
    /// Incremental chunks, in order.
    Chunks(Vec<Value>),
}

impl ToolOutput {
    /// Render each piece as message text. Strings are used verbatim,
    /// everything else is serialized as JSON.
    pub fn into_texts(self) -> Vec<String> {
        let render = |v: Value| match v {
            Value::String(s) => s,
            other => other.to_string(),
        };
        match self {
            Self::Value(v) => vec![render(v)],
            Self::Chunks(chunks) => chunks.into_iter().map(render).collect(),
        }
    }
}

/// Something that can run tools.
#[async_trait]
pub trait ToolProvider: Send + Sync {
    /// Names of the tools this provider can run.
    fn tool_names(&self) -> Vec<String>;

    /// Specs advertised to the model.
    fn tool_specs(&self) -> Vec<ToolSpec> {
        Vec::new()
    }

    /// Whether this provider can run `name`.
    fn has_tool(&self, name: &str) -> bool {
        self.tool_names().iter().any(|n| n == name)
    }

    /// Run one tool.
    async fn run_tool(
        &self,
        name: &str,
        ctx: &ToolContext,
        args: Value,
    ) -> Result<ToolOutput, ToolError>;
}

/// Priority-ordered union of several providers.
#[derive(Clone, Default)]
pub struct CompositeToolProvider {
    providers: Vec<Arc<dyn ToolProvider>>,
}

impl CompositeToolProvider {
    /// Empty composite (knows no tools).
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a provider with lower priority than those already added.
    #[must_use]
    pub fn with(mut self, provider: Arc<dyn ToolProvider>) -> Self {
        self.providers.push(provider);
        self
    }

    /// Number of composed providers.
    pub fn len(&self) -> usize {
        self.providers.len()
    }

    /// Whether no providers are composed.
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

#[async_trait]
impl ToolProvider for CompositeToolProvider {
    fn tool_names(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.providers
            .iter()
            .flat_map(|p| p.tool_names())
            .filter(|name| seen.insert(name.clone()))
            .collect()
    }

    fn tool_specs(&self) -> Vec<ToolSpec> {
        let mut seen = HashSet::new();
        self.providers
            .iter()
            .flat_map(|p| p.tool_specs())
            .filter(|spec| seen.insert(spec.name.clone()))
            .collect()
    }

    async fn run_tool(
        &self,
        name: &str,
        ctx: &ToolContext,
        args: Value,
    ) -> Result<ToolOutput, ToolError> {
        for (priority, provider) in self.providers.iter().enumerate() {
            if provider.has_tool(name) {
                debug!(tool = name, priority, "dispatching tool call");
                return provider.run_tool(name, ctx, args).await;
            }
        }
        Err(ToolError::NotFound { name: name.to_owned() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Fixed {
        names: Vec<&'static str>,
        reply: &'static str,
    }

    #[async_trait]
    impl ToolProvider for Fixed {
        fn tool_names(&self) -> Vec<String> {
            self.names.iter().map(|s| (*s).to_owned()).collect()
        }

        async fn run_tool(
            &self,
            _name: &str,
            _ctx: &ToolContext,
            _args: Value,
        ) -> Result<ToolOutput, ToolError> {
            Ok(ToolOutput::Value(json!(self.reply)))
        }
    }

    fn ctx() -> ToolContext {
        ToolContext {
            session_id: SessionId::from("s"),
            agent_name: "executor".into(),
            cancel: CancellationToken::new(),
        }
    }

    fn composite() -> CompositeToolProvider {
        CompositeToolProvider::new()
            .with(Arc::new(Fixed { names: vec!["search", "calc"], reply: "first" }))
            .with(Arc::new(Fixed { names: vec!["calc", "clock"], reply: "second" }))
    }

    #[test]
    fn names_are_unioned_in_priority_order() {
        assert_eq!(composite().tool_names(), vec!["search", "calc", "clock"]);
    }

    #[tokio::test]
    async fn first_provider_with_tool_wins() {
        let out = composite().run_tool("calc", &ctx(), json!({})).await.unwrap();
        assert_eq!(out, ToolOutput::Value(json!("first")));
        let out = composite().run_tool("clock", &ctx(), json!({})).await.unwrap();
        assert_eq!(out, ToolOutput::Value(json!("second")));
    }

    #[tokio::test]
    async fn unknown_tool_is_not_found() {
        let err = composite().run_tool("nope", &ctx(), json!({})).await.unwrap_err();
        assert!(matches!(err, ToolError::NotFound { name } if name == "nope"));
    }

    #[test]
    fn output_renders_texts() {
        assert_eq!(ToolOutput::Value(json!("plain")).into_texts(), vec!["plain"]);
        assert_eq!(
            ToolOutput::Chunks(vec![json!({"a": 1}), json!("b")]).into_texts(),
            vec!["{\"a\":1}".to_owned(), "b".to_owned()]
        );
    }
}
