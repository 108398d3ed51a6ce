//! # sage-runtime
//!
//! Session execution for the Sage orchestrator.
//!
//! - **lock**: Per-session mutual exclusion (memory and lease backends)
//! - **ledger**: Sub-tasks with forward-only status transitions
//! - **session**: `SessionContext` plus the explicit `SessionRegistry`
//! - **agents**: Phase sub-agents, the streaming runner and its emitter
//! - **orchestrator**: Decompose, plan/execute/observe, summarise
//! - **errors**: `RuntimeError` and its category taxonomy

#![deny(unsafe_code)]

pub mod agents;
pub mod errors;
pub mod ledger;
pub mod lock;
pub mod orchestrator;
pub mod session;

pub use agents::{CompletionStatus, Emitter, Observation, Phase, PhaseOutput, PhaseRunner};
pub use errors::RuntimeError;
pub use ledger::{LedgerError, TaskLedger};
pub use lock::{LockBackend, LockError, LockHandle, LockManager};
pub use orchestrator::{Orchestrator, OrchestratorConfig, RunOutcome, RunRequest, SessionRun};
pub use session::{SessionContext, SessionRegistry};
