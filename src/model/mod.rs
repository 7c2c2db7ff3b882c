//! Model client abstractions for interacting with LLM and embedding APIs.
//!
//! This module provides:
//! - [`api::LlmClient`] / [`api::ChatModel`] -- OpenAI-compatible chat
//!   completion client, raw and pinned to one model.
//! - [`embedding::EmbeddingClient`] -- OpenAI-compatible embedding client
//!   used by the embedding deduplicator.
//! - [`prompt`] -- prompt templates for the generator, reflector and curator.
//! - [`usage::UsageLog`] -- per-call token accounting (`llm_calls.jsonl`).

pub mod api;
pub mod embedding;
pub mod prompt;
pub mod usage;

pub use api::{ChatMessage, ChatModel, ChatResponse, Choice, LlmClient, Usage};
pub use embedding::EmbeddingClient;
pub use usage::{CallTag, LlmCallRecord, TokenTotals, UsageLog};
