//! Session state and the process-wide registry.

mod context;
mod registry;

pub use context::{
    AUDIT_BUDGET, AUDIT_NEEDS_CONTINUATION, AUDIT_OBSERVATIONS, AUDIT_TOKEN_USAGE, SessionContext,
    SessionState,
};
pub use registry::SessionRegistry;
