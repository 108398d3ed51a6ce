//! # sage-wire
//!
//! The caller-facing contract: one JSON object per line for every emitted
//! message, then a `stream_end` terminator.
//!
//! - **coalesce**: Hold tool-call fragments until their arguments are whole
//! - **clean**: Strip inline images and truncate oversized tool payloads
//! - **ndjson**: Field stripping, line encoding and the terminator
//! - **error**: `WireError`

#![deny(unsafe_code)]

pub mod clean;
pub mod coalesce;
pub mod error;
pub mod ndjson;

pub use clean::{ContentCleaner, IMAGE_PLACEHOLDER, TRUNCATION_MARKER};
pub use coalesce::ToolCallCoalescer;
pub use error::WireError;
pub use ndjson::{StreamEnd, encode_message, encode_stream, to_wire_value, write_stream};
