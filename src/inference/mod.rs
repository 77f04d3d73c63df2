//! Inference orchestration: backend lifecycle, generation state and streaming.
//!
//! # Architecture
//!
//! ```text
//!   OrchestratorClient ──Command──▶ Orchestrator ──StatusMessage──▶ OrchestratorClient
//!                                      │
//!                       ┌──────────────┼───────────────┐
//!                       ▼              ▼               ▼
//!                 BackendHandle   InterruptToken   StreamingEmitter
//!                (single-flight)   (shared flag)    └─ GenerationRun
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use thinkstream_core::inference::Orchestrator;
//! use thinkstream_core::protocol::ChatMessage;
//!
//! let mut client = Orchestrator::from_config(&config).spawn()?;
//! client.load()?;
//! client.generate(&[ChatMessage::user("Solve x^2-3x+2=0")])?;
//! while let Some(event) = client.next_event().await {
//!     println!("{event:?}");
//! }
//! ```

mod client;
mod handle;
mod interrupt;
mod orchestrator;
mod state;
mod streamer;

pub use client::{CommandSender, OrchestratorClient};
pub use handle::BackendHandle;
pub use interrupt::InterruptToken;
pub use orchestrator::{Orchestrator, OrchestratorBuilder};
pub use state::{throughput, GenerationRun};
pub use streamer::StreamingEmitter;
