//! # SSE Parser
//!
//! Buffers a chunked HTTP body, splits it into lines and yields the payload
//! of every `data:` line. Comments, other fields, empty payloads and the
//! `[DONE]` marker are dropped.

use bytes::{Bytes, BytesMut};
use futures::Stream;
use tokio_stream::StreamExt;
use tracing::warn;

/// Options for the SSE parser.
#[derive(Clone, Copy, Debug)]
pub struct SseParserOptions {
    /// Whether an unterminated final line is still parsed when the body ends.
    pub process_remaining_buffer: bool,
}

impl Default for SseParserOptions {
    fn default() -> Self {
        Self {
            process_remaining_buffer: true,
        }
    }
}

/// Parse SSE lines from a byte stream and yield the raw `data:` payloads.
///
/// A transport error ends the stream after a warning; the consumer sees a
/// short stream rather than an error.
pub fn parse_sse_lines<S, E>(byte_stream: S, options: SseParserOptions) -> impl Stream<Item = String> + Send
where
    S: Stream<Item = Result<Bytes, E>> + Send + Unpin + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let process_remaining = options.process_remaining_buffer;

    futures::stream::unfold(
        (byte_stream, BytesMut::with_capacity(8192), false),
        move |(mut stream, mut buffer, done)| async move {
            if done {
                return None;
            }

            loop {
                if let Some(newline_pos) = buffer.iter().position(|&b| b == b'\n') {
                    let mut line_bytes = buffer.split_to(newline_pos + 1);
                    line_bytes.truncate(line_bytes.len() - 1);
                    if line_bytes.last() == Some(&b'\r') {
                        line_bytes.truncate(line_bytes.len() - 1);
                    }

                    let Ok(line) = std::str::from_utf8(&line_bytes) else {
                        continue;
                    };

                    if let Some(data) = extract_sse_data(line) {
                        return Some((data, (stream, buffer, false)));
                    }
                    continue;
                }

                match stream.next().await {
                    Some(Ok(chunk)) => buffer.extend_from_slice(&chunk),
                    Some(Err(e)) => {
                        warn!("SSE stream read error: {e}");
                        return None;
                    }
                    None => {
                        if process_remaining && !buffer.is_empty() {
                            let line = std::str::from_utf8(&buffer).ok()?.trim().to_owned();
                            if let Some(data) = extract_sse_data(&line) {
                                buffer.clear();
                                return Some((data, (stream, buffer, true)));
                            }
                        }
                        return None;
                    }
                }
            }
        },
    )
}

/// Extract the payload of one SSE line.
fn extract_sse_data(line: &str) -> Option<String> {
    let trimmed = line.trim();

    if trimmed.is_empty() || trimmed.starts_with(':') {
        return None;
    }

    let data = trimmed
        .strip_prefix("data: ")
        .or_else(|| trimmed.strip_prefix("data:"))?
        .trim();

    if data.is_empty() || data == "[DONE]" {
        return None;
    }

    Some(data.to_string())
}

/// Parse JSON from an SSE payload, logging and returning `None` on failure.
pub fn parse_sse_data<T: serde::de::DeserializeOwned>(data: &str, source: &str) -> Option<T> {
    match serde_json::from_str(data) {
        Ok(parsed) => Some(parsed),
        Err(e) => {
            let preview: String = data.chars().take(100).collect();
            warn!(source, error = %e, data_preview = %preview, "failed to parse SSE data");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Chunk = Result<Bytes, std::io::Error>;

    async fn collect(chunks: Vec<Chunk>, options: SseParserOptions) -> Vec<String> {
        parse_sse_lines(futures::stream::iter(chunks), options)
            .collect()
            .await
    }

    #[test]
    fn extract_variants() {
        assert_eq!(extract_sse_data("data: {\"a\":1}"), Some("{\"a\":1}".into()));
        assert_eq!(extract_sse_data("data:{\"a\":1}"), Some("{\"a\":1}".into()));
        assert_eq!(extract_sse_data("data: [DONE]"), None);
        assert_eq!(extract_sse_data("data: "), None);
        assert_eq!(extract_sse_data(": keepalive"), None);
        assert_eq!(extract_sse_data("event: message"), None);
        assert_eq!(extract_sse_data(""), None);
    }

    #[test]
    fn parse_data_invalid_json_is_none() {
        assert!(parse_sse_data::<serde_json::Value>("nope", "test").is_none());
        let v: serde_json::Value = parse_sse_data("{\"k\":2}", "test").unwrap();
        assert_eq!(v["k"], 2);
    }

    #[tokio::test]
    async fn events_split_across_chunks() {
        let out = collect(
            vec![
                Ok(Bytes::from("data: {\"par")),
                Ok(Bytes::from("tial\":true}\r\n\r\ndata: {\"b\":2}\n\n")),
            ],
            SseParserOptions::default(),
        )
        .await;
        assert_eq!(out, vec!["{\"partial\":true}", "{\"b\":2}"]);
    }

    #[tokio::test]
    async fn done_marker_and_comments_filtered() {
        let out = collect(
            vec![Ok(Bytes::from(": hi\n\ndata: {\"ok\":1}\n\ndata: [DONE]\n\n"))],
            SseParserOptions::default(),
        )
        .await;
        assert_eq!(out, vec!["{\"ok\":1}"]);
    }

    #[tokio::test]
    async fn remaining_buffer_is_optional() {
        let chunks = || vec![Ok(Bytes::from("data: {\"tail\":true}"))];
        let on = collect(chunks(), SseParserOptions { process_remaining_buffer: true }).await;
        assert_eq!(on.len(), 1);
        let off = collect(chunks(), SseParserOptions { process_remaining_buffer: false }).await;
        assert!(off.is_empty());
    }

    #[tokio::test]
    async fn read_error_ends_stream() {
        let out = collect(
            vec![
                Ok(Bytes::from("data: {\"a\":1}\n\n")),
                Err(std::io::Error::other("reset")),
                Ok(Bytes::from("data: {\"b\":2}\n\n")),
            ],
            SseParserOptions::default(),
        )
        .await;
        assert_eq!(out, vec!["{\"a\":1}"]);
    }
}
