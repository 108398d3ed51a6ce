//! # sage-core
//!
//! Shared vocabulary for the Sage session orchestrator.
//!
//! - **ids**: Branded newtype IDs (`SessionId`, `MessageId`)
//! - **messages**: `Message`, `ToolCall`, closed `Role`/`MessageType` enums
//! - **tasks**: Ledger entries and their forward-only status machine
//! - **session**: Session status plus the persistence boundary
//! - **model**: Streaming model-call boundary (`ModelClient`)
//! - **tools**: Tool boundary (`ToolProvider`, `CompositeToolProvider`)
//! - **errors**: Error types shared across crates

#![deny(unsafe_code)]

pub mod errors;
pub mod ids;
pub mod messages;
pub mod model;
pub mod session;
pub mod tasks;
pub mod tools;

pub use errors::{MessageError, ModelError, PersistenceError, ToolError};
pub use ids::{MessageId, SessionId};
pub use messages::{FunctionCall, Message, MessageType, Role, ToolCall};
pub use session::{SessionPersister, SessionSnapshot, SessionStatus};
pub use tasks::{Task, TaskStats, TaskStatus, TaskTransition};
