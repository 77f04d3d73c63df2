//! Message protocol between a UI process and the orchestrator.
//!
//! Commands flow UI → orchestrator and are tagged by `type`; status events
//! flow orchestrator → UI and are tagged by `status`. Nothing is shared by
//! reference across the boundary: both directions are plain values that
//! serialize to one JSON object each.
//!
//! ```text
//! UI                                   Orchestrator
//!  │ {"type":"generate","data":[..]}  ──▶ │
//!  │ ◀── {"status":"start"}               │
//!  │ ◀── {"status":"update",...}  (×N)    │
//!  │ ◀── {"status":"complete",...}        │
//! ```

pub mod codec;
pub mod conversation;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ChatError, ErrorKind};

pub use conversation::{parse_conversation, validate_conversation};

/// Speaker of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// One turn of a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Generation phase reported with every `update` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Thinking,
    Answering,
}

/// UI → orchestrator command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Command {
    /// Probe for GPU acceleration.
    Check,
    /// Resolve the backend and warm it up.
    Load,
    /// Stream a reply to the conversation in `data`.
    ///
    /// `data` stays untyped until the handler validates it so that a
    /// malformed payload is reported as an input error rather than a
    /// protocol error.
    Generate {
        #[serde(default)]
        data: Value,
    },
    /// Trip the interrupt token.
    Interrupt,
    /// Clear the interrupt token.
    Reset,
}

impl Command {
    /// Build a `generate` command from a typed conversation.
    pub fn generate(messages: &[ChatMessage]) -> Self {
        let data = messages
            .iter()
            .map(|m| {
                serde_json::json!({
                    "role": m.role.as_str(),
                    "content": m.content,
                })
            })
            .collect();
        Self::Generate {
            data: Value::Array(data),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Check => "check",
            Self::Load => "load",
            Self::Generate { .. } => "generate",
            Self::Interrupt => "interrupt",
            Self::Reset => "reset",
        }
    }
}

/// Payload of a `complete` event.
///
/// The orchestrator always sends the full candidate list; a single string is
/// accepted on the way in for compatibility with producers that pre-reduce.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CompletionOutput {
    Single(String),
    Sequences(Vec<String>),
}

impl CompletionOutput {
    /// The canonical answer: the first candidate.
    pub fn canonical(&self) -> Option<&str> {
        match self {
            Self::Single(s) => Some(s.as_str()),
            Self::Sequences(seqs) => seqs.first().map(String::as_str),
        }
    }

    /// Every candidate, unreduced.
    pub fn candidates(&self) -> Vec<&str> {
        match self {
            Self::Single(s) => vec![s.as_str()],
            Self::Sequences(seqs) => seqs.iter().map(String::as_str).collect(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Single(_) => 1,
            Self::Sequences(seqs) => seqs.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Orchestrator → UI status event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum StatusMessage {
    /// Backend available, or capability check passed.
    Ready {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<String>,
    },
    /// Human-readable progress label.
    Loading { data: String },
    /// Per-file artifact acquisition progress (0..=100).
    Progress {
        file: String,
        progress: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        total: Option<u64>,
    },
    /// A generation run has begun.
    Start,
    /// One incremental fragment of generated text.
    Update {
        output: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tps: Option<f64>,
        #[serde(rename = "numTokens", default)]
        num_tokens: usize,
        state: Phase,
    },
    /// Terminal event of a successful (possibly interrupted) run.
    Complete {
        output: CompletionOutput,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        interrupted: bool,
    },
    /// Terminal event of the triggering command only.
    Error {
        #[serde(alias = "data")]
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        kind: Option<ErrorKind>,
    },
}

impl StatusMessage {
    pub fn ready() -> Self {
        Self::Ready { data: None }
    }

    pub fn loading(label: impl Into<String>) -> Self {
        Self::Loading { data: label.into() }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete { .. } | Self::Error { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Ready { .. } => "ready",
            Self::Loading { .. } => "loading",
            Self::Progress { .. } => "progress",
            Self::Start => "start",
            Self::Update { .. } => "update",
            Self::Complete { .. } => "complete",
            Self::Error { .. } => "error",
        }
    }
}

impl From<&ChatError> for StatusMessage {
    fn from(err: &ChatError) -> Self {
        Self::Error {
            error: err.to_string(),
            kind: Some(err.kind()),
        }
    }
}
