//! ACE: Agentic Context Engineering
//!
//! A continual-learning harness in which an agent improves by growing a
//! playbook of strategy bullets instead of updating weights. Each sample is
//! attempted by a generator inside a code sandbox, diagnosed by a reflector,
//! and distilled by a curator into playbook edits.

pub mod adaptation;
pub mod config;
pub mod env;
pub mod error;
pub mod model;
pub mod playbook;
pub mod roles;
pub mod trajectory;

#[cfg(test)]
pub(crate) mod testing;
