//! Turn grouping and the active-window split.

use sage_core::{Message, Role};
use tracing::{debug, warn};

use crate::tokens::messages_tokens;

/// One user message plus every following non-user message.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Turn {
    /// Messages in chronological order.
    pub messages: Vec<Message>,
}

impl Turn {
    /// Estimated token cost of the whole turn.
    pub fn tokens(&self) -> usize {
        messages_tokens(&self.messages)
    }

    /// All message contents joined by newlines.
    pub fn text(&self) -> String {
        self.messages
            .iter()
            .map(Message::content_str)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Group `messages` into turns.
///
/// A normal user message opens a turn. User messages of any other type are
/// dropped. Leading non-user messages open a turn of their own.
pub fn group_turns(messages: &[Message]) -> Vec<Turn> {
    let mut turns: Vec<Turn> = Vec::new();
    for msg in messages {
        if msg.role == Role::User {
            if msg.starts_turn() {
                turns.push(Turn {
                    messages: vec![msg.clone()],
                });
            } else {
                debug!(message_id = %msg.id, kind = %msg.kind, "dropping non-normal user message from turns");
            }
            continue;
        }
        match turns.last_mut() {
            Some(turn) => turn.messages.push(msg.clone()),
            None => turns.push(Turn {
                messages: vec![msg.clone()],
            }),
        }
    }
    turns
}

/// Result of [`split_by_turn`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TurnSplit {
    /// Most recent turns, flattened, chronological.
    pub active: Vec<Message>,
    /// Older turns, chronological.
    pub history: Vec<Turn>,
    /// Estimated cost of `active`.
    pub active_tokens: usize,
    /// Estimated cost of `history`.
    pub history_tokens: usize,
}

impl TurnSplit {
    /// History flattened into messages.
    pub fn history_messages(&self) -> Vec<Message> {
        self.history
            .iter()
            .flat_map(|t| t.messages.iter().cloned())
            .collect()
    }
}

/// Fill the active window newest-first with whole turns.
///
/// The newest turn is always active even when it alone exceeds
/// `active_budget`; the walk stops at the first older turn that does not
/// fit. With `recent_turn_limit > 0` only the most recent turns are kept at
/// all.
pub fn split_by_turn(messages: &[Message], active_budget: usize, recent_turn_limit: usize) -> TurnSplit {
    let mut turns = group_turns(messages);
    if recent_turn_limit > 0 && turns.len() > recent_turn_limit {
        let dropped = turns.len() - recent_turn_limit;
        let _ = turns.drain(..dropped);
        debug!(dropped, kept = recent_turn_limit, "recent turn limit applied");
    }
    if turns.is_empty() {
        return TurnSplit::default();
    }

    let mut active_tokens = 0;
    let mut active_count = 0;
    for turn in turns.iter().rev() {
        let cost = turn.tokens();
        if active_tokens + cost <= active_budget || active_count == 0 {
            active_tokens += cost;
            active_count += 1;
            if active_tokens > active_budget {
                warn!(
                    turn_tokens = cost,
                    active_budget, "newest turn exceeds the active budget, keeping it anyway"
                );
                break;
            }
        } else {
            break;
        }
    }

    let split_at = turns.len() - active_count;
    let active_turns = turns.split_off(split_at);
    let active: Vec<Message> = active_turns.into_iter().flat_map(|t| t.messages).collect();
    let history = turns;
    let history_tokens = history.iter().map(Turn::tokens).sum();

    debug!(
        active_messages = active.len(),
        active_tokens,
        history_turns = history.len(),
        history_tokens,
        "messages split by turn"
    );

    TurnSplit {
        active,
        history,
        active_tokens,
        history_tokens,
    }
}
