//! CLI and model-SDK glue for the autonomous build runner.
//!
//! The core (`forge_core`) never depends on a concrete LLM SDK; this crate
//! supplies the one concrete piece it's missing: a `forge_core::AgentClient`
//! built on `rig-core`, plus the CLI that wires a project, a spec, and that
//! client into `forge_core::coder_loop::CoderLoop`.

pub mod client;
pub mod config;
pub mod prompts;

pub use client::RigAgentClient;
pub use config::{check_endpoint, AgentConfig};
pub use prompts::{BasicInsightExtractor, BasicPromptGenerator};
