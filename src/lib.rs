//! thinkstream: a streaming orchestrator for reasoning language models.
//!
//! A single long-lived [`inference::Orchestrator`] owns the model backend and
//! talks to front ends through two message types: [`protocol::Command`]
//! coming in and [`protocol::StatusMessage`] going out. Generated text is
//! streamed fragment by fragment, tagged with whether the model is still
//! thinking or already answering.

pub mod chat;
pub mod cli;
pub mod config;
pub mod constants;
pub mod error;
pub mod inference;
pub mod protocol;
pub mod runtime;

// Re-export commonly used types
pub use chat::{ChatSession, SessionEvent};
pub use config::ThinkstreamConfig;
pub use error::{ChatError, ErrorKind, Result};
pub use inference::{Orchestrator, OrchestratorClient};
pub use protocol::{ChatMessage, Command, CompletionOutput, Phase, Role, StatusMessage};
