//! Fragment merging.
//!
//! Fragments of one logical message share an id and arrive contiguously
//! from a single producer, so only the last message in the list can ever be
//! continued. A fragment whose id differs from the last message starts a new
//! message.

use sage_core::{Message, MessageError, ToolCall};

/// What [`merge_into`] did with a fragment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The fragment started a new message.
    Appended,
    /// The fragment continued the last message.
    Extended,
}

fn append_text(dst: &mut Option<String>, src: Option<&str>) {
    if let Some(text) = src {
        dst.get_or_insert_with(String::new).push_str(text);
    }
}

fn merge_tool_calls(dst: &mut Option<Vec<ToolCall>>, src: Option<&[ToolCall]>) {
    let Some(incoming) = src else {
        return;
    };
    let calls = dst.get_or_insert_with(Vec::new);
    for fragment in incoming {
        match calls.iter_mut().find(|c| c.id == fragment.id) {
            Some(existing) => existing.absorb(fragment),
            None => calls.push(fragment.clone()),
        }
    }
}

/// Fold `fragment` into `target` in place.
pub fn merge_into(target: &mut Vec<Message>, fragment: Message) -> Result<MergeOutcome, MessageError> {
    if fragment.id.is_empty() {
        return Err(MessageError::EmptyId);
    }
    if let Some(last) = target.last_mut().filter(|last| last.id == fragment.id) {
        append_text(&mut last.content, fragment.content.as_deref());
        append_text(&mut last.show_content, fragment.show_content.as_deref());
        merge_tool_calls(&mut last.tool_calls, fragment.tool_calls.as_deref());
        last.is_final = fragment.is_final;
        last.is_chunk = fragment.is_chunk;
        return Ok(MergeOutcome::Extended);
    }
    target.push(fragment);
    Ok(MergeOutcome::Appended)
}

/// Return a new list with `fragment` folded into a copy of `target`.
pub fn merge(fragment: &Message, target: &[Message]) -> Result<Vec<Message>, MessageError> {
    let mut merged = target.to_vec();
    let _ = merge_into(&mut merged, fragment.clone())?;
    Ok(merged)
}
