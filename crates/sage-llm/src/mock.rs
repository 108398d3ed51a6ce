//! Scripted [`ModelClient`] for tests and offline runs.
//!
//! Responses come from a FIFO script first, then from an optional responder
//! closure that can route on the request (for example on the system prompt).
//! Text is streamed in small slices so downstream merging and tag parsing see
//! realistic fragment boundaries.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;

use sage_core::messages::ToolCall;
use sage_core::model::{DeltaStream, ModelClient, ModelDelta, ModelRequest, TokenUsage, ToolCallDelta};
use sage_core::ModelError;

/// One scripted model answer.
#[derive(Clone, Debug)]
pub enum MockResponse {
    /// Plain text, streamed in slices and followed by a usage delta.
    Text(String),
    /// Tool calls, streamed with ids and names first and arguments split.
    ToolCalls(Vec<ToolCall>),
    /// Exact deltas, streamed as given.
    Deltas(Vec<ModelDelta>),
    /// Reject the call with an API error.
    Error {
        /// HTTP-like status.
        status: u16,
        /// Error text.
        message: String,
    },
    /// Stream some text, then fail with a transport error.
    FailAfter(String),
    /// Never yield; only ends when the consumer drops the stream.
    Hang,
}

impl MockResponse {
    /// Shorthand for [`MockResponse::Text`].
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }

    /// Shorthand for a single tool call.
    pub fn tool_call(id: &str, name: &str, arguments: serde_json::Value) -> Self {
        Self::ToolCalls(vec![ToolCall::new(id, name, arguments.to_string())])
    }
}

type Responder = dyn Fn(&ModelRequest) -> MockResponse + Send + Sync;

/// Scripted model client.
pub struct MockModelClient {
    name: String,
    script: Mutex<VecDeque<MockResponse>>,
    responder: Option<Box<Responder>>,
    requests: Mutex<Vec<ModelRequest>>,
    chunk_chars: usize,
    chunk_delay: Option<Duration>,
}

impl Default for MockModelClient {
    fn default() -> Self {
        Self {
            name: "mock".into(),
            script: Mutex::new(VecDeque::new()),
            responder: None,
            requests: Mutex::new(Vec::new()),
            chunk_chars: 8,
            chunk_delay: None,
        }
    }
}

impl MockModelClient {
    /// Client that answers from `script` in order.
    pub fn scripted(script: impl IntoIterator<Item = MockResponse>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            ..Self::default()
        }
    }

    /// Client that computes each answer from the request.
    pub fn from_fn<F>(responder: F) -> Self
    where
        F: Fn(&ModelRequest) -> MockResponse + Send + Sync + 'static,
    {
        Self {
            responder: Some(Box::new(responder)),
            ..Self::default()
        }
    }

    /// Queue another scripted answer.
    pub fn push(&self, response: MockResponse) {
        self.script.lock().push_back(response);
    }

    /// Slice size for streamed text (minimum 1).
    #[must_use]
    pub fn with_chunk_chars(mut self, chars: usize) -> Self {
        self.chunk_chars = chars.max(1);
        self
    }

    /// Pause before every delta.
    #[must_use]
    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = Some(delay);
        self
    }

    /// Requests received so far.
    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().clone()
    }

    /// Number of calls received so far.
    pub fn call_count(&self) -> usize {
        self.requests.lock().len()
    }

    fn next_response(&self, request: &ModelRequest) -> Option<MockResponse> {
        if let Some(response) = self.script.lock().pop_front() {
            return Some(response);
        }
        self.responder.as_ref().map(|f| f(request))
    }

    fn split_text(&self, text: &str) -> Vec<ModelDelta> {
        let chars: Vec<char> = text.chars().collect();
        chars
            .chunks(self.chunk_chars)
            .map(|slice| ModelDelta::text(slice.iter().collect::<String>()))
            .collect()
    }
}

fn approx_tokens(chars: usize) -> u64 {
    u64::try_from(chars.div_ceil(4)).unwrap_or(u64::MAX)
}

fn usage_for(request: &ModelRequest, output_chars: usize) -> TokenUsage {
    let prompt_chars = request.system_prompt.chars().count()
        + request
            .messages
            .iter()
            .map(|m| m.content_str().chars().count())
            .sum::<usize>();
    let prompt_tokens = approx_tokens(prompt_chars);
    let completion_tokens = approx_tokens(output_chars);
    TokenUsage {
        prompt_tokens,
        completion_tokens,
        total_tokens: prompt_tokens + completion_tokens,
    }
}

fn tool_call_deltas(calls: &[ToolCall]) -> Vec<ModelDelta> {
    let mut deltas = Vec::new();
    for (index, call) in calls.iter().enumerate() {
        let args = &call.function.arguments;
        let mid = args
            .char_indices()
            .map(|(i, _)| i)
            .nth(args.chars().count() / 2)
            .unwrap_or(args.len());
        deltas.push(ModelDelta {
            tool_calls: vec![ToolCallDelta {
                index,
                id: Some(call.id.clone()),
                name: Some(call.function.name.clone()),
                arguments: Some(args[..mid].to_string()),
            }],
            ..ModelDelta::default()
        });
        deltas.push(ModelDelta {
            tool_calls: vec![ToolCallDelta {
                index,
                id: None,
                name: None,
                arguments: Some(args[mid..].to_string()),
            }],
            ..ModelDelta::default()
        });
    }
    deltas
}

#[async_trait]
impl ModelClient for MockModelClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn stream(&self, request: ModelRequest) -> Result<DeltaStream, ModelError> {
        let response = self.next_response(&request);
        let items: Vec<Result<ModelDelta, ModelError>> = match response {
            None => {
                self.requests.lock().push(request);
                return Err(ModelError::Other {
                    message: "mock model has no scripted response".into(),
                });
            }
            Some(MockResponse::Error { status, message }) => {
                self.requests.lock().push(request);
                return Err(ModelError::Api { status, message });
            }
            Some(MockResponse::Hang) => {
                self.requests.lock().push(request);
                return Ok(Box::pin(futures::stream::pending::<Result<ModelDelta, ModelError>>()));
            }
            Some(MockResponse::Text(text)) => {
                let mut deltas = self.split_text(&text);
                deltas.push(ModelDelta::usage(usage_for(&request, text.chars().count())));
                deltas.into_iter().map(Ok).collect()
            }
            Some(MockResponse::ToolCalls(calls)) => {
                let chars = calls.iter().map(|c| c.function.arguments.len()).sum();
                let mut deltas = tool_call_deltas(&calls);
                deltas.push(ModelDelta::usage(usage_for(&request, chars)));
                deltas.into_iter().map(Ok).collect()
            }
            Some(MockResponse::Deltas(deltas)) => deltas.into_iter().map(Ok).collect(),
            Some(MockResponse::FailAfter(text)) => {
                let mut items: Vec<_> = self.split_text(&text).into_iter().map(Ok).collect();
                items.push(Err(ModelError::Transport {
                    message: "connection reset".into(),
                    retryable: true,
                }));
                items
            }
        };
        self.requests.lock().push(request);

        let items = futures::stream::iter(items);
        let stream: DeltaStream = match self.chunk_delay {
            Some(delay) => Box::pin(items.then(move |item| async move {
                tokio::time::sleep(delay).await;
                item
            })),
            None => Box::pin(items),
        };
        Ok(stream)
    }
}
