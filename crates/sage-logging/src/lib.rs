//! # sage-logging
//!
//! Structured logging with `tracing`.
//!
//! Log context (session id, phase, lock key) travels in span and event
//! fields rather than in formatted strings. [`init_subscriber`] sets up the
//! process-wide subscriber; [`capture_logs`] gives tests a thread-local
//! subscriber whose events can be asserted on.

#![deny(unsafe_code)]

pub mod capture;

pub use capture::{CapturedEvent, CapturedLogs, capture_logs};

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Initialize the global tracing subscriber writing to stderr.
///
/// `RUST_LOG` takes precedence over `level`. With `json` set, events are
/// written as JSON lines (one object per event, span fields flattened into
/// the `span` key); otherwise the compact human format is used. Calling this
/// more than once is a no-op.
pub fn init_subscriber(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if json {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .with_target(true)
            .with_writer(std::io::stderr);
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer)
            .try_init();
    } else {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .compact()
            .with_target(true)
            .with_writer(std::io::stderr);
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer)
            .try_init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        init_subscriber("warn", false);
        init_subscriber("debug", true);
        tracing::info!("still fine after double init");
    }
}
