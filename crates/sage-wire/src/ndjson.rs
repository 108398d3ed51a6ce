//! Newline-delimited JSON encoding.

use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::debug;

use sage_core::{Message, MessageType, SessionId};

use crate::clean::ContentCleaner;
use crate::coalesce::ToolCallCoalescer;
use crate::error::WireError;

/// Fields that only matter inside the process.
const TRANSPORT_FIELDS: [&str; 3] = ["message_type", "is_final", "is_chunk"];

/// Terminal object of every stream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StreamEnd {
    #[serde(rename = "type")]
    kind: &'static str,
    /// Session the stream belonged to.
    pub session_id: SessionId,
    /// When the stream ended.
    pub timestamp: DateTime<Utc>,
    /// Message lines emitted before the terminator.
    pub total_stream_count: usize,
}

impl StreamEnd {
    /// Terminator for `session_id` after `total_stream_count` lines.
    pub fn new(session_id: SessionId, total_stream_count: usize) -> Self {
        Self {
            kind: "stream_end",
            session_id,
            timestamp: Utc::now(),
            total_stream_count,
        }
    }

    /// Encode as one line (no trailing newline).
    pub fn to_line(&self) -> Result<String, WireError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Field map of `message` as sent to callers: transport fields stripped,
/// nulls omitted.
pub fn to_wire_value(message: &Message) -> Result<Value, WireError> {
    let mut value = serde_json::to_value(message)?;
    if let Value::Object(map) = &mut value {
        for field in TRANSPORT_FIELDS {
            let _ = map.remove(field);
        }
        map.retain(|_, v| !v.is_null());
    }
    Ok(value)
}

/// One line for `message`, or `None` for events callers never see.
pub fn encode_message(message: &Message) -> Result<Option<String>, WireError> {
    if message.kind == MessageType::TokenUsage {
        return Ok(None);
    }
    Ok(Some(serde_json::to_string(&to_wire_value(message)?)?))
}

/// Encode a run's fragments as lines, ending with [`StreamEnd`].
///
/// Tool-call fragments are coalesced and whatever is still held when the
/// input ends is released before the terminator.
pub fn encode_stream<S>(
    session_id: SessionId,
    messages: S,
    cleaner: ContentCleaner,
) -> impl Stream<Item = Result<String, WireError>> + Send
where
    S: Stream<Item = Message> + Send,
{
    async_stream::try_stream! {
        let mut messages = Box::pin(messages);
        let mut coalescer = ToolCallCoalescer::new();
        let mut count = 0usize;

        while let Some(message) = messages.next().await {
            for ready in coalescer.push(message) {
                if let Some(line) = encode_message(&cleaner.clean(ready))? {
                    count += 1;
                    yield line;
                }
            }
        }
        for ready in coalescer.flush() {
            if let Some(line) = encode_message(&cleaner.clean(ready))? {
                count += 1;
                yield line;
            }
        }

        debug!(session_id = %session_id, count, "stream finished");
        yield StreamEnd::new(session_id, count).to_line()?;
    }
}

/// Write every line followed by `\n`. Returns the number of lines written.
pub async fn write_stream<W, S>(writer: &mut W, lines: S) -> Result<usize, WireError>
where
    W: AsyncWrite + Unpin,
    S: Stream<Item = Result<String, WireError>>,
{
    let mut lines = Box::pin(lines);
    let mut written = 0;
    while let Some(line) = lines.next().await {
        let line = line?;
        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        written += 1;
    }
    writer.flush().await?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sage_core::{MessageId, ToolCall};

    fn text(id: &str, body: &str) -> Message {
        Message::assistant(MessageId::from(id), MessageType::Planning, body)
            .with_agent("planner")
            .chunk()
    }

    #[test]
    fn transport_fields_are_stripped() {
        let mut msg = text("m1", "hi").finished();
        msg.message_type = Some(MessageType::Planning);
        let value = to_wire_value(&msg).unwrap();
        let map = value.as_object().unwrap();

        assert!(!map.contains_key("message_type"));
        assert!(!map.contains_key("is_final"));
        assert!(!map.contains_key("is_chunk"));
        assert!(!map.contains_key("tool_calls"));
        assert_eq!(map["message_id"], "m1");
        assert_eq!(map["type"], "planning");
        assert_eq!(map["agent_name"], "planner");
    }

    #[test]
    fn token_usage_is_not_encoded() {
        let msg = Message::assistant(MessageId::new(), MessageType::TokenUsage, "{}");
        assert!(encode_message(&msg).unwrap().is_none());
    }

    #[test]
    fn null_metadata_values_survive_but_top_level_nulls_do_not() {
        let mut msg = text("m", "x");
        let mut meta = serde_json::Map::new();
        let _ = meta.insert("k".into(), Value::Null);
        msg.metadata = Some(meta);
        let value = to_wire_value(&msg).unwrap();
        assert!(value["metadata"].as_object().unwrap().contains_key("k"));
    }

    #[tokio::test]
    async fn stream_ends_with_terminator_counting_lines() {
        let session = SessionId::from("s1");
        let usage = Message::assistant(MessageId::new(), MessageType::TokenUsage, "{}");
        let input = futures::stream::iter(vec![text("a", "one"), text("a", " two"), usage, text("b", "three")]);

        let lines: Vec<String> = encode_stream(session, input, ContentCleaner::default())
            .map(Result::unwrap)
            .collect()
            .await;

        assert_eq!(lines.len(), 4);
        let end: Value = serde_json::from_str(lines.last().unwrap()).unwrap();
        assert_eq!(end["type"], "stream_end");
        assert_eq!(end["session_id"], "s1");
        assert_eq!(end["total_stream_count"], 3);
        assert!(end["timestamp"].is_string());
    }

    #[tokio::test]
    async fn tool_fragments_arrive_whole() {
        let frag = |args: &str, name: &str| {
            Message::assistant_tool_calls(MessageId::from("calls"), vec![ToolCall::new("c1", name, args)]).chunk()
        };
        let input = futures::stream::iter(vec![frag("{\"q\":", "search"), frag("\"primes\"}", "")]);

        let lines: Vec<String> = encode_stream(SessionId::from("s"), input, ContentCleaner::default())
            .map(Result::unwrap)
            .collect()
            .await;

        assert_eq!(lines.len(), 2);
        let call: Value = serde_json::from_str(&lines[0]).unwrap();
        assert_eq!(call["tool_calls"][0]["function"]["arguments"], "{\"q\":\"primes\"}");
        assert_eq!(call["tool_calls"][0]["function"]["name"], "search");
    }

    #[tokio::test]
    async fn write_stream_emits_newline_per_line() {
        let input = futures::stream::iter(vec![text("a", "x")]);
        let mut out: Vec<u8> = Vec::new();
        let written = write_stream(
            &mut out,
            encode_stream(SessionId::from("s"), input, ContentCleaner::default()),
        )
        .await
        .unwrap();

        assert_eq!(written, 2);
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text.lines().count(), 2);
        assert!(text.ends_with('\n'));
    }
}
