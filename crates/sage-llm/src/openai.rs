//! # OpenAI-compatible client
//!
//! Streams `POST {base_url}/chat/completions` with `stream: true` and maps
//! each chunk onto a [`ModelDelta`]. Works against any server that speaks
//! the Chat Completions SSE dialect.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use sage_core::messages::{Message, Role, ToolCall};
use sage_core::model::{
    DeltaStream, ModelClient, ModelDelta, ModelRequest, TokenUsage, ToolCallDelta, ToolSpec,
};
use sage_core::ModelError;
use sage_settings::ModelSettings;

use crate::sse::{SseParserOptions, parse_sse_data, parse_sse_lines};

const SSE_OPTIONS: SseParserOptions = SseParserOptions {
    process_remaining_buffer: false,
};

/// Connection settings for [`OpenAiCompatClient`].
#[derive(Clone, Debug)]
pub struct OpenAiConfig {
    /// Base URL, without the `/chat/completions` suffix.
    pub base_url: String,
    /// Model name.
    pub model: String,
    /// Bearer token; omitted for local servers that need none.
    pub api_key: Option<String>,
    /// Sampling temperature used when the request does not set one.
    pub temperature: f32,
    /// Whole-request timeout.
    pub request_timeout: Duration,
}

impl OpenAiConfig {
    /// Build from settings, reading the key from the configured env var.
    pub fn from_settings(settings: &ModelSettings) -> Self {
        let api_key = std::env::var(&settings.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty());
        Self {
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            model: settings.model.clone(),
            api_key,
            temperature: settings.temperature,
            request_timeout: Duration::from_secs(settings.request_timeout_secs),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Wire types
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    stream: bool,
    stream_options: StreamOptions,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ChatTool<'a>>,
}

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Debug, PartialEq, Serialize)]
struct ChatMessage {
    role: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<ToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct ChatTool<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    function: &'a ToolSpec,
}

#[derive(Debug, Deserialize)]
struct ChatChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    usage: Option<TokenUsage>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ChunkToolCall>,
}

#[derive(Debug, Deserialize)]
struct ChunkToolCall {
    #[serde(default)]
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<ChunkFunction>,
}

#[derive(Debug, Deserialize)]
struct ChunkFunction {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

fn to_chat_message(message: &Message) -> ChatMessage {
    ChatMessage {
        role: message.role.as_str(),
        content: message.content.clone(),
        tool_calls: message.tool_calls.clone().filter(|c| !c.is_empty()),
        tool_call_id: message.tool_call_id.clone(),
    }
}

fn build_messages(request: &ModelRequest) -> Vec<ChatMessage> {
    let mut out = Vec::with_capacity(request.messages.len() + 1);
    if !request.system_prompt.is_empty() {
        out.push(ChatMessage {
            role: Role::System.as_str(),
            content: Some(request.system_prompt.clone()),
            tool_calls: None,
            tool_call_id: None,
        });
    }
    out.extend(request.messages.iter().map(to_chat_message));
    out
}

/// Map one decoded chunk to a delta. Chunks that carry nothing are dropped.
fn chunk_to_delta(chunk: ChatChunk) -> Option<ModelDelta> {
    let mut delta = ModelDelta {
        usage: chunk.usage,
        ..ModelDelta::default()
    };
    if let Some(choice) = chunk.choices.into_iter().next() {
        delta.content = choice.delta.content.filter(|c| !c.is_empty());
        delta.reasoning_content = choice.delta.reasoning_content.filter(|c| !c.is_empty());
        delta.tool_calls = choice
            .delta
            .tool_calls
            .into_iter()
            .map(|call| {
                let (name, arguments) = call
                    .function
                    .map(|f| (f.name, f.arguments))
                    .unwrap_or_default();
                ToolCallDelta {
                    index: call.index,
                    id: call.id,
                    name,
                    arguments,
                }
            })
            .collect();
    }

    let empty = delta.content.is_none()
        && delta.reasoning_content.is_none()
        && delta.tool_calls.is_empty()
        && delta.usage.is_none();
    (!empty).then_some(delta)
}

/// Parse an API error response body.
fn parse_api_error(body: &str, status: u16) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|json| json["error"]["message"].as_str().map(String::from))
        .unwrap_or_else(|| format!("HTTP {status}: {body}"))
}

// ─────────────────────────────────────────────────────────────────────────────
// Client
// ─────────────────────────────────────────────────────────────────────────────

/// Streaming client for OpenAI-compatible Chat Completions endpoints.
pub struct OpenAiCompatClient {
    config: OpenAiConfig,
    client: reqwest::Client,
}

impl OpenAiCompatClient {
    /// Create a client. Fails only if the HTTP client cannot be built.
    pub fn new(config: OpenAiConfig) -> Result<Self, ModelError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ModelError::Other {
                message: format!("http client: {e}"),
            })?;
        Ok(Self { config, client })
    }

    /// Model name sent with each request.
    pub fn model(&self) -> &str {
        &self.config.model
    }

    fn build_headers(&self) -> Result<HeaderMap, ModelError> {
        let mut headers = HeaderMap::new();
        let _ = headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let _ = headers.insert(ACCEPT, HeaderValue::from_static("text/event-stream"));
        if let Some(key) = &self.config.api_key {
            let value = HeaderValue::from_str(&format!("Bearer {key}")).map_err(|e| {
                ModelError::Other {
                    message: format!("invalid authorization header: {e}"),
                }
            })?;
            let _ = headers.insert(AUTHORIZATION, value);
        }
        Ok(headers)
    }
}

#[async_trait]
impl ModelClient for OpenAiCompatClient {
    fn name(&self) -> &str {
        &self.config.model
    }

    async fn stream(&self, request: ModelRequest) -> Result<DeltaStream, ModelError> {
        debug!(
            model = %self.config.model,
            message_count = request.messages.len(),
            tool_count = request.tools.len(),
            "starting chat completion stream"
        );

        let body = ChatRequest {
            model: &self.config.model,
            messages: build_messages(&request),
            stream: true,
            stream_options: StreamOptions { include_usage: true },
            temperature: request.temperature.unwrap_or(self.config.temperature),
            max_tokens: request.max_tokens,
            tools: request
                .tools
                .iter()
                .map(|function| ChatTool {
                    kind: "function",
                    function,
                })
                .collect(),
        };

        let url = format!("{}/chat/completions", self.config.base_url);
        let response = self
            .client
            .post(&url)
            .headers(self.build_headers()?)
            .json(&body)
            .send()
            .await
            .map_err(|e| ModelError::Transport {
                message: e.to_string(),
                retryable: e.is_timeout() || e.is_connect(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            let message = parse_api_error(&body_text, status.as_u16());
            warn!(status = status.as_u16(), %message, "chat completion rejected");
            return Err(ModelError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let deltas = parse_sse_lines(response.bytes_stream(), SSE_OPTIONS)
            .filter_map(|line| {
                let delta = parse_sse_data::<ChatChunk>(&line, "chat_completions")
                    .and_then(chunk_to_delta);
                std::future::ready(delta)
            })
            .map(Ok::<_, ModelError>);

        Ok(Box::pin(deltas))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use sage_core::{MessageId, MessageType};
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(base_url: &str) -> OpenAiConfig {
        OpenAiConfig {
            base_url: base_url.to_string(),
            model: "test-model".into(),
            api_key: Some("sk-test".into()),
            temperature: 0.2,
            request_timeout: Duration::from_secs(5),
        }
    }

    fn sse_body(events: &[Value]) -> String {
        let mut body = String::new();
        for event in events {
            body.push_str(&format!("data: {event}\n\n"));
        }
        body.push_str("data: [DONE]\n\n");
        body
    }

    #[test]
    fn system_prompt_leads_messages() {
        let request = ModelRequest {
            system_prompt: "be brief".into(),
            messages: vec![Message::user("hi")],
            ..ModelRequest::default()
        };
        let messages = build_messages(&request);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, "system");
        assert_eq!(messages[1].role, "user");
        assert_eq!(messages[1].content.as_deref(), Some("hi"));
    }

    #[test]
    fn tool_messages_keep_call_id() {
        let msg = Message::tool_result(MessageId::from("t1"), "call_1", "42");
        let wire = to_chat_message(&msg);
        assert_eq!(wire.role, "tool");
        assert_eq!(wire.tool_call_id.as_deref(), Some("call_1"));
    }

    #[test]
    fn chunk_maps_tool_call_fragments() {
        let chunk: ChatChunk = serde_json::from_value(json!({
            "choices": [{"delta": {"tool_calls": [
                {"index": 0, "id": "call_1", "function": {"name": "calc", "arguments": "{\"a\""}}
            ]}}]
        }))
        .unwrap();
        let delta = chunk_to_delta(chunk).unwrap();
        assert_eq!(delta.tool_calls.len(), 1);
        assert_eq!(delta.tool_calls[0].id.as_deref(), Some("call_1"));
        assert_eq!(delta.tool_calls[0].arguments.as_deref(), Some("{\"a\""));
    }

    #[test]
    fn empty_chunk_dropped() {
        let chunk: ChatChunk =
            serde_json::from_value(json!({"choices": [{"delta": {"content": ""}}]})).unwrap();
        assert!(chunk_to_delta(chunk).is_none());
    }

    #[test]
    fn api_error_message_extracted() {
        let body = r#"{"error":{"message":"rate limited","type":"rate_limit"}}"#;
        assert_eq!(parse_api_error(body, 429), "rate limited");
        assert_eq!(parse_api_error("oops", 500), "HTTP 500: oops");
    }

    #[tokio::test]
    async fn streams_text_and_usage() {
        let server = MockServer::start().await;
        let body = sse_body(&[
            json!({"choices": [{"delta": {"role": "assistant", "content": "Hel"}}]}),
            json!({"choices": [{"delta": {"content": "lo"}}]}),
            json!({"choices": [], "usage": {"prompt_tokens": 3, "completion_tokens": 2, "total_tokens": 5}}),
        ]);
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .and(body_partial_json(json!({"model": "test-model", "stream": true})))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .mount(&server)
            .await;

        let client = OpenAiCompatClient::new(config(&server.uri())).unwrap();
        let request = ModelRequest {
            messages: vec![
                Message::user("hi"),
                Message::assistant(MessageId::from("a"), MessageType::Normal, "earlier"),
            ],
            ..ModelRequest::default()
        };
        let deltas: Vec<ModelDelta> = client
            .stream(request)
            .await
            .unwrap()
            .map(Result::unwrap)
            .collect()
            .await;

        let text: String = deltas.iter().filter_map(|d| d.content.clone()).collect();
        assert_eq!(text, "Hello");
        assert_eq!(deltas.last().and_then(|d| d.usage).map(|u| u.total_tokens), Some(5));
    }

    #[tokio::test]
    async fn malformed_lines_are_skipped() {
        let server = MockServer::start().await;
        let body = "data: not-json\n\ndata: {\"choices\":[{\"delta\":{\"content\":\"ok\"}}]}\n\ndata: [DONE]\n\n";
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .mount(&server)
            .await;

        let client = OpenAiCompatClient::new(config(&server.uri())).unwrap();
        let deltas: Vec<_> = client
            .stream(ModelRequest::default())
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(deltas.len(), 1);
    }

    #[tokio::test]
    async fn error_status_maps_to_api_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(503).set_body_json(json!({"error": {"message": "overloaded"}})),
            )
            .mount(&server)
            .await;

        let client = OpenAiCompatClient::new(config(&server.uri())).unwrap();
        let err = client.stream(ModelRequest::default()).await.err().unwrap();
        assert_matches!(err, ModelError::Api { status: 503, ref message } if message == "overloaded");
        assert!(err.is_retryable());
    }
}
