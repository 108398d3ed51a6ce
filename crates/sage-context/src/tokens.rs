//! Per-character token estimate.
//!
//! Weights: CJK ideograph 0.6, other letters 0.25, digits 0.2, anything
//! else 0.4. The result is deterministic and monotonic in the input, which
//! is all budgeting needs; it is not meant for billing.

use sage_core::Message;

const CJK_WEIGHT: f64 = 0.6;
const LETTER_WEIGHT: f64 = 0.25;
const DIGIT_WEIGHT: f64 = 0.2;
const OTHER_WEIGHT: f64 = 0.4;

/// Whether `c` is in the CJK Unified Ideographs block.
pub fn is_cjk(c: char) -> bool {
    ('\u{4e00}'..='\u{9fff}').contains(&c)
}

fn char_weight(c: char) -> f64 {
    if is_cjk(c) {
        CJK_WEIGHT
    } else if c.is_alphabetic() {
        LETTER_WEIGHT
    } else if c.is_numeric() {
        DIGIT_WEIGHT
    } else {
        OTHER_WEIGHT
    }
}

/// Estimated token count of `text` (fractional sum, truncated).
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn estimate_tokens(text: &str) -> usize {
    let total: f64 = text.chars().map(char_weight).sum();
    total as usize
}

/// Estimated cost of one message. Only `content` counts.
pub fn message_tokens(message: &Message) -> usize {
    estimate_tokens(message.content_str())
}

/// Estimated cost of a slice of messages.
pub fn messages_tokens(messages: &[Message]) -> usize {
    messages.iter().map(message_tokens).sum()
}
