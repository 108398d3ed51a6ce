//! # sage-llm
//!
//! Implementations of [`sage_core::model::ModelClient`].
//!
//! - **sse**: Line-buffered Server-Sent Events parser over a byte stream
//! - **openai**: Chat Completions streaming client for any OpenAI-compatible endpoint
//! - **mock**: Scripted client for tests and offline runs

#![deny(unsafe_code)]

pub mod mock;
pub mod openai;
pub mod sse;

pub use mock::{MockModelClient, MockResponse};
pub use openai::{OpenAiCompatClient, OpenAiConfig};
