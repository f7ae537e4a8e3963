//! Judge model transport.
//!
//! Provides an OpenAI-compatible client for the grading model and the
//! rubric texts and reply formats used in grading prompts.

mod client;
mod prompts;

pub use client::{LlmClient, LlmResponse, Message, Role, TokenUsage};
pub use prompts::Prompts;
