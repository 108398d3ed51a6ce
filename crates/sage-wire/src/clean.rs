//! Display cleanup applied just before a message leaves the process.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use sage_core::{Message, Role};

/// Replacement for inline base64 images in display text.
pub const IMAGE_PLACEHOLDER: &str = "[BASE64_IMAGE_REMOVED_FOR_DISPLAY]";

/// Suffix appended to truncated tool payload fields.
pub const TRUNCATION_MARKER: &str = "...[TRUNCATED]";

/// Tool result fields that may hold page-sized text.
const BULKY_FIELDS: [&str; 3] = ["snippet", "description", "content"];

static BASE64_IMAGE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"data:image/[A-Za-z0-9.+-]+;base64,[A-Za-z0-9+/=]+").unwrap());

/// Rewrites display fields; the persisted history is never touched.
#[derive(Clone, Debug)]
pub struct ContentCleaner {
    max_field_chars: usize,
}

impl Default for ContentCleaner {
    fn default() -> Self {
        Self { max_field_chars: 1000 }
    }
}

fn truncate_chars(text: &str, max: usize) -> Option<String> {
    let (cut, _) = text.char_indices().nth(max)?;
    Some(format!("{}{TRUNCATION_MARKER}", &text[..cut]))
}

impl ContentCleaner {
    /// Cleaner truncating bulky tool fields beyond `max_field_chars`.
    pub fn new(max_field_chars: usize) -> Self {
        Self { max_field_chars }
    }

    /// Clean one outgoing message.
    pub fn clean(&self, mut message: Message) -> Message {
        if let Some(show) = message.show_content.as_mut() {
            if BASE64_IMAGE.is_match(show) {
                *show = BASE64_IMAGE.replace_all(show, IMAGE_PLACEHOLDER).into_owned();
            }
        }
        if message.role == Role::Tool {
            if let Some(content) = message.content.as_mut() {
                if let Some(shortened) = self.shorten_json(content) {
                    *content = shortened;
                }
            }
        }
        message
    }

    /// Truncated re-serialization of `content`, or `None` when it is not
    /// JSON or nothing needed cutting.
    fn shorten_json(&self, content: &str) -> Option<String> {
        let mut value: Value = serde_json::from_str(content).ok()?;
        if !self.truncate_fields(&mut value) {
            return None;
        }
        serde_json::to_string(&value).ok()
    }

    fn truncate_fields(&self, value: &mut Value) -> bool {
        match value {
            Value::Object(map) => {
                let mut changed = false;
                for (key, field) in map.iter_mut() {
                    if let Value::String(text) = field {
                        if BULKY_FIELDS.contains(&key.as_str()) {
                            if let Some(cut) = truncate_chars(text, self.max_field_chars) {
                                *text = cut;
                                changed = true;
                            }
                        }
                    } else {
                        changed |= self.truncate_fields(field);
                    }
                }
                changed
            }
            Value::Array(items) => items
                .iter_mut()
                .fold(false, |changed, item| self.truncate_fields(item) || changed),
            _ => false,
        }
    }
}
