//! Tool-call fragment coalescing.
//!
//! A tool call streams its arguments in pieces. Forwarding those pieces one
//! by one would show clients a truncated JSON string, so consecutive
//! fragments of one tool call are held and folded together, then released
//! as a single message once a fragment for a different call (or anything
//! that is not a tool call) arrives, or the stream ends.

use sage_context::merge_into;
use sage_core::Message;
use tracing::warn;

/// Folds tool-call fragments; everything else passes straight through.
#[derive(Debug, Default)]
pub struct ToolCallCoalescer {
    pending: Vec<Message>,
}

fn carries_calls(message: &Message) -> bool {
    message.tool_calls.as_ref().is_some_and(|calls| !calls.is_empty())
}

fn call_id(message: &Message) -> Option<&str> {
    message.tool_calls.as_ref()?.last().map(|call| call.id.as_str())
}

impl ToolCallCoalescer {
    /// Empty coalescer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a tool-call message is being held.
    pub fn is_holding(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Feed one fragment; returns what may be forwarded now, in order.
    pub fn push(&mut self, fragment: Message) -> Vec<Message> {
        if !carries_calls(&fragment) {
            let mut out = self.flush();
            out.push(fragment);
            return out;
        }

        let continues = self
            .pending
            .last()
            .is_some_and(|held| held.id == fragment.id && call_id(held) == call_id(&fragment));
        let mut out = if continues { Vec::new() } else { self.flush() };
        if let Err(err) = merge_into(&mut self.pending, fragment) {
            warn!(error = %err, "dropping invalid tool-call fragment");
        }
        if self.complete() {
            out.extend(self.flush());
        }
        out
    }

    /// Release whatever is held. Call at end of stream and on cancellation.
    pub fn flush(&mut self) -> Vec<Message> {
        std::mem::take(&mut self.pending)
    }

    /// The held message was marked final and every call's arguments parse.
    fn complete(&self) -> bool {
        self.pending.last().is_some_and(|held| {
            held.is_final
                && held
                    .tool_calls
                    .iter()
                    .flatten()
                    .all(|call| call.parse_arguments().is_ok())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sage_core::{MessageId, MessageType, ToolCall};

    fn call_fragment(id: &str, call_id: &str, name: &str, args: &str) -> Message {
        Message::assistant_tool_calls(MessageId::from(id), vec![ToolCall::new(call_id, name, args)]).chunk()
    }

    fn text(id: &str, body: &str) -> Message {
        Message::assistant(MessageId::from(id), MessageType::Execution, body)
    }

    #[test]
    fn text_passes_through() {
        let mut c = ToolCallCoalescer::new();
        let out = c.push(text("a", "hello"));
        assert_eq!(out.len(), 1);
        assert!(!c.is_holding());
    }

    #[test]
    fn fragments_fold_until_next_message() {
        let mut c = ToolCallCoalescer::new();
        assert!(c.push(call_fragment("m", "c1", "search", r#"{"q": "pri"#)).is_empty());
        assert!(c.push(call_fragment("m", "c1", "", r#"mes"}"#)).is_empty());
        assert!(c.is_holding());

        let out = c.push(text("n", "done"));
        assert_eq!(out.len(), 2);
        let calls = out[0].tool_calls.as_ref().unwrap();
        assert_eq!(calls[0].function.name, "search");
        assert_eq!(calls[0].function.arguments, r#"{"q": "primes"}"#);
        assert_eq!(out[1].content_str(), "done");
    }

    #[test]
    fn next_call_id_releases_previous_call() {
        let mut c = ToolCallCoalescer::new();
        assert!(c.push(call_fragment("m", "c1", "a", "{}")).is_empty());
        let out = c.push(call_fragment("m", "c2", "b", "{\"x\":"));
        assert_eq!(out.len(), 1);
        let released = out[0].tool_calls.as_ref().unwrap();
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].id, "c1");
        assert!(c.is_holding());

        assert!(c.push(call_fragment("m", "c2", "", "1}")).is_empty());
        let out = c.flush();
        let calls = out[0].tool_calls.as_ref().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "c2");
        assert_eq!(calls[0].function.arguments, "{\"x\":1}");
    }

    #[test]
    fn new_tool_message_releases_previous() {
        let mut c = ToolCallCoalescer::new();
        let _ = c.push(call_fragment("m1", "c1", "a", "{}"));
        let out = c.push(call_fragment("m2", "c2", "b", "{}"));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].id, MessageId::from("m1"));
        assert!(c.is_holding());
    }

    #[test]
    fn final_complete_fragment_releases_immediately() {
        let mut c = ToolCallCoalescer::new();
        let _ = c.push(call_fragment("m", "c1", "a", "{\"n\":"));
        let out = c.push(call_fragment("m", "c1", "", "1}").finished());
        assert_eq!(out.len(), 1);
        assert!(!c.is_holding());
    }

    #[test]
    fn final_but_truncated_keeps_holding() {
        let mut c = ToolCallCoalescer::new();
        let out = c.push(call_fragment("m", "c1", "a", "{\"n\":").finished());
        assert!(out.is_empty());
        assert_eq!(c.flush().len(), 1);
    }
}
