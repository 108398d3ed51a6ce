//! Per-call context assembly.

use sage_core::{Message, MessageType};
use serde::Serialize;
use tracing::debug;

use crate::budget::{BudgetConfig, BudgetInfo, compute_budget};
use crate::errors::ContextError;
use crate::retriever::retrieve_turns;
use crate::turns::{Turn, split_by_turn};

/// Messages chosen for one model call plus the budget that chose them.
#[derive(Clone, Debug, Serialize)]
pub struct AssembledContext {
    /// Retrieved history followed by the active window.
    pub messages: Vec<Message>,
    /// Allowances used.
    pub budget: BudgetInfo,
    /// History turns that survived retrieval.
    pub history_turns_kept: usize,
    /// History turns that were candidates.
    pub history_turns_total: usize,
}

/// Reasoning and usage reports are session record, not conversation.
fn is_model_input(message: &Message) -> bool {
    !matches!(message.kind, MessageType::Thinking | MessageType::TokenUsage)
}

/// Newest history turns that fit in `budget`, chronological.
fn newest_fitting(turns: &[Turn], budget: usize) -> Vec<Turn> {
    let mut used = 0;
    let mut kept = Vec::new();
    for turn in turns.iter().rev() {
        let cost = turn.tokens();
        if used + cost > budget {
            break;
        }
        used += cost;
        kept.push(turn.clone());
    }
    kept.reverse();
    kept
}

/// Build the message list for a call whose fixed prefix is `system_prompt`.
///
/// Fails when the prefix alone exhausts the window. History is re-ranked
/// against `query`; with no query the newest history that fits is kept.
/// Thinking and token-usage messages are never sent back to the model.
pub fn assemble_context(
    system_prompt: &str,
    messages: &[Message],
    query: &str,
    config: &BudgetConfig,
) -> Result<AssembledContext, ContextError> {
    let budget = compute_budget(system_prompt, config.max_model_len, &config.ratios);
    if budget.is_exhausted() {
        return Err(ContextError::PrefixExceedsModelLength {
            fixed_cost_tokens: budget.fixed_cost_tokens,
            max_model_len: config.max_model_len,
        });
    }

    let conversation: Vec<Message> = messages.iter().filter(|m| is_model_input(m)).cloned().collect();
    let split = split_by_turn(&conversation, budget.active_budget, config.recent_turns);
    let history = if query.trim().is_empty() {
        newest_fitting(&split.history, budget.history_budget)
    } else {
        retrieve_turns(&split.history, query, budget.history_budget)
    };

    let history_turns_kept = history.len();
    let history_turns_total = split.history.len();
    let mut assembled: Vec<Message> = history.into_iter().flat_map(|t| t.messages).collect();
    assembled.extend(split.active);

    debug!(
        messages = assembled.len(),
        history_turns_kept, history_turns_total, "context assembled"
    );

    Ok(AssembledContext {
        messages: assembled,
        budget,
        history_turns_kept,
        history_turns_total,
    })
}
