//! # sage-context
//!
//! Everything that decides what the model sees and how streamed output
//! becomes messages:
//!
//! - **tokens**: Per-character token estimate (no tokenizer dependency)
//! - **budget**: Split the context window into history / active / output allowances
//! - **turns**: Group messages into turns and fill the active window newest-first
//! - **retriever**: BM25 re-ranking of older turns against the current query
//! - **window**: Assemble the budgeted message list for one model call
//! - **merger**: Fold streamed fragments into addressable messages
//! - **tag_stream**: Character-level state machine for `<tag>...</tag>` output

#![deny(unsafe_code)]

pub mod budget;
pub mod errors;
pub mod merger;
pub mod retriever;
pub mod tag_stream;
pub mod tokens;
pub mod turns;
pub mod window;

pub use budget::{BudgetConfig, BudgetInfo, BudgetRatios, compute_budget};
pub use errors::ContextError;
pub use merger::{MergeOutcome, merge, merge_into};
pub use retriever::{retrieve, retrieve_turns};
pub use tag_stream::{TagEvent, TagState, TagStreamParser};
pub use tokens::{estimate_tokens, message_tokens, messages_tokens};
pub use turns::{Turn, TurnSplit, group_turns, split_by_turn};
pub use window::{AssembledContext, assemble_context};
