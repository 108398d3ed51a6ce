//! Streaming parser for `<tag>...</tag>` delimited model output.
//!
//! Sub-agents answer in loosely XML-tagged text and the text arrives in
//! arbitrary slices. The parser consumes one character at a time:
//!
//! - `Outside`: plain text outside any tag
//! - `InsideTag(name)`: text inside `<name>`
//! - `Unknown { pending, .. }`: saw `<` and cannot yet tell whether this is a
//!   tag; the buffered characters are released as text once it is clear
//!   they are not
//!
//! Tags do not nest. An opening tag inside another tag, or a closing tag
//! that does not match the open one, is ordinary text.

const MAX_PENDING: usize = 64;

/// Parser state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TagState {
    /// Not inside any tag.
    Outside,
    /// Inside `<name>`.
    InsideTag(String),
    /// Buffering a possible tag.
    Unknown {
        /// Characters seen since `<`.
        pending: String,
        /// Tag we were inside when `<` arrived.
        enclosing: Option<String>,
    },
}

/// Output of the parser.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TagEvent {
    /// Text, attributed to the enclosing tag if any.
    Text {
        /// Enclosing tag.
        tag: Option<String>,
        /// The text.
        text: String,
    },
    /// `<name>` was recognised.
    Open(String),
    /// `</name>` was recognised.
    Close(String),
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

/// Whether `pending` could still grow into `<name>` or `</name>`.
fn is_tag_prefix(pending: &str) -> bool {
    let Some(rest) = pending.strip_prefix('<') else {
        return false;
    };
    let name = rest.strip_prefix('/').unwrap_or(rest);
    name.chars().all(is_name_char)
}

fn resume(enclosing: Option<String>) -> TagState {
    match enclosing {
        Some(name) => TagState::InsideTag(name),
        None => TagState::Outside,
    }
}

/// Pure transition function: one character in, next state and at most one event out.
pub fn step(state: TagState, ch: char) -> (TagState, Option<TagEvent>) {
    match state {
        TagState::Outside => {
            if ch == '<' {
                (
                    TagState::Unknown {
                        pending: "<".into(),
                        enclosing: None,
                    },
                    None,
                )
            } else {
                (
                    TagState::Outside,
                    Some(TagEvent::Text {
                        tag: None,
                        text: ch.to_string(),
                    }),
                )
            }
        }
        TagState::InsideTag(name) => {
            if ch == '<' {
                (
                    TagState::Unknown {
                        pending: "<".into(),
                        enclosing: Some(name),
                    },
                    None,
                )
            } else {
                let event = TagEvent::Text {
                    tag: Some(name.clone()),
                    text: ch.to_string(),
                };
                (TagState::InsideTag(name), Some(event))
            }
        }
        TagState::Unknown { mut pending, enclosing } => {
            if ch == '>' {
                return close_pending(&pending, enclosing);
            }
            if ch == '<' {
                // The buffered text was not a tag; a new candidate starts here.
                let event = TagEvent::Text {
                    tag: enclosing.clone(),
                    text: pending,
                };
                return (
                    TagState::Unknown {
                        pending: "<".into(),
                        enclosing,
                    },
                    Some(event),
                );
            }
            pending.push(ch);
            if is_tag_prefix(&pending) && pending.len() < MAX_PENDING {
                (TagState::Unknown { pending, enclosing }, None)
            } else {
                let event = TagEvent::Text {
                    tag: enclosing.clone(),
                    text: pending,
                };
                (resume(enclosing), Some(event))
            }
        }
    }
}

/// Resolve a buffered candidate on `>`.
fn close_pending(pending: &str, enclosing: Option<String>) -> (TagState, Option<TagEvent>) {
    let literal = || TagEvent::Text {
        tag: enclosing.clone(),
        text: format!("{pending}>"),
    };
    if let Some(name) = pending.strip_prefix("</") {
        if !name.is_empty() && enclosing.as_deref() == Some(name) {
            return (TagState::Outside, Some(TagEvent::Close(name.to_owned())));
        }
        let event = literal();
        return (resume(enclosing), Some(event));
    }
    let name = pending.trim_start_matches('<');
    if !name.is_empty() && enclosing.is_none() {
        return (TagState::InsideTag(name.to_owned()), Some(TagEvent::Open(name.to_owned())));
    }
    let event = literal();
    (resume(enclosing), Some(event))
}

/// Incremental parser over string slices.
#[derive(Debug)]
pub struct TagStreamParser {
    state: TagState,
}

impl Default for TagStreamParser {
    fn default() -> Self {
        Self::new()
    }
}

impl TagStreamParser {
    /// Parser in the `Outside` state.
    pub fn new() -> Self {
        Self {
            state: TagState::Outside,
        }
    }

    /// Current state.
    pub fn state(&self) -> &TagState {
        &self.state
    }

    /// Consume a slice; adjacent text with the same tag is coalesced.
    pub fn push_str(&mut self, chunk: &str) -> Vec<TagEvent> {
        let mut events = Vec::new();
        for ch in chunk.chars() {
            let state = std::mem::replace(&mut self.state, TagState::Outside);
            let (next, event) = step(state, ch);
            self.state = next;
            if let Some(event) = event {
                push_coalesced(&mut events, event);
            }
        }
        events
    }

    /// End of input: release any buffered candidate as text.
    pub fn finish(&mut self) -> Vec<TagEvent> {
        match std::mem::replace(&mut self.state, TagState::Outside) {
            TagState::Unknown { pending, enclosing } => vec![TagEvent::Text {
                tag: enclosing,
                text: pending,
            }],
            TagState::Outside | TagState::InsideTag(_) => Vec::new(),
        }
    }
}

fn push_coalesced(events: &mut Vec<TagEvent>, event: TagEvent) {
    if let TagEvent::Text { tag, text } = &event {
        if let Some(TagEvent::Text {
            tag: last_tag,
            text: last_text,
        }) = events.last_mut()
        {
            if last_tag == tag {
                last_text.push_str(text);
                return;
            }
        }
    }
    events.push(event);
}

/// Text inside the first `<name>` element of a complete document.
pub fn extract_tag(text: &str, name: &str) -> Option<String> {
    extract_all(text, name).into_iter().next()
}

/// Text inside every `<name>` element of a complete document, in order.
/// An element left open at the end of input still counts.
pub fn extract_all(text: &str, name: &str) -> Vec<String> {
    let mut parser = TagStreamParser::new();
    let mut events = parser.push_str(text);
    events.extend(parser.finish());

    let mut found = Vec::new();
    let mut current: Option<String> = None;
    for event in events {
        match event {
            TagEvent::Open(tag) if tag == name => current = Some(String::new()),
            TagEvent::Text { tag: Some(tag), text } if tag == name => {
                if let Some(buf) = current.as_mut() {
                    buf.push_str(&text);
                }
            }
            TagEvent::Close(tag) if tag == name => {
                if let Some(buf) = current.take() {
                    found.push(buf.trim().to_owned());
                }
            }
            _ => {}
        }
    }
    if let Some(buf) = current {
        found.push(buf.trim().to_owned());
    }
    found
}
