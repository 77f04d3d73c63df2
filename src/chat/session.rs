//! Client-side conversation state driven by orchestrator status events.
//!
//! `ChatSession` is what a renderer sits on: it keeps committed history, the
//! in-flight thinking/answer buffers and per-file load progress, and turns
//! every `StatusMessage` into a `SessionEvent` describing what to redraw.

use chrono::{DateTime, Local};
use std::collections::BTreeMap;
use tracing::{debug, warn};

use crate::constants::thinking;
use crate::error::{ChatError, Result};
use crate::protocol::{ChatMessage, Command, CompletionOutput, Phase, StatusMessage};

use super::response::{clean_message_history, process_message, validate_message_output};

/// Minimum change in percentage points before a progress redraw
const PROGRESS_STEP: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    Initializing,
    Loading,
    Ready,
    Error,
}

/// One committed turn
#[derive(Debug, Clone, PartialEq)]
pub struct SessionMessage {
    pub message: ChatMessage,
    pub timestamp: DateTime<Local>,
    /// Extracted reasoning of an assistant turn
    pub thinking: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FileProgress {
    pub progress: f64,
    pub total: Option<u64>,
}

/// What changed after applying a status event
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Status(WorkerStatus),
    Loading(String),
    Progress {
        file: String,
        progress: f64,
        total: Option<u64>,
    },
    GenerationStarted,
    Fragment {
        text: String,
        phase: Phase,
        tps: Option<f64>,
        num_tokens: usize,
    },
    Committed {
        answer: String,
        thinking: String,
        interrupted: bool,
    },
    Failed(ChatError),
    /// Nothing to redraw
    Ignored,
}

#[derive(Debug)]
pub struct ChatSession {
    history: Vec<SessionMessage>,
    status: WorkerStatus,
    generating: bool,
    thinking_buffer: String,
    answer_buffer: String,
    last_error: Option<ChatError>,
    progress: BTreeMap<String, FileProgress>,
    candidates: Vec<String>,
}

impl Default for ChatSession {
    fn default() -> Self {
        Self::new()
    }
}

impl ChatSession {
    pub fn new() -> Self {
        Self {
            history: Vec::new(),
            status: WorkerStatus::Initializing,
            generating: false,
            thinking_buffer: String::new(),
            answer_buffer: String::new(),
            last_error: None,
            progress: BTreeMap::new(),
            candidates: Vec::new(),
        }
    }

    pub fn status(&self) -> WorkerStatus {
        self.status
    }

    pub fn is_generating(&self) -> bool {
        self.generating
    }

    pub fn history(&self) -> &[SessionMessage] {
        &self.history
    }

    /// Committed turns as plain messages, uncleaned
    pub fn messages(&self) -> Vec<ChatMessage> {
        self.history.iter().map(|m| m.message.clone()).collect()
    }

    pub fn thinking_buffer(&self) -> &str {
        &self.thinking_buffer
    }

    pub fn answer_buffer(&self) -> &str {
        &self.answer_buffer
    }

    pub fn last_error(&self) -> Option<&ChatError> {
        self.last_error.as_ref()
    }

    pub fn progress(&self) -> &BTreeMap<String, FileProgress> {
        &self.progress
    }

    /// Every candidate of the last completed run, canonical first
    pub fn last_candidates(&self) -> &[String] {
        &self.candidates
    }

    /// Record a user turn and build the `generate` command for it.
    ///
    /// The command carries the cleaned history: assistant turns are reduced
    /// to their answers so no markers or delimiters are re-submitted.
    pub fn prepare_generate(&mut self, content: &str) -> Result<Command> {
        if self.status != WorkerStatus::Ready {
            return Err(ChatError::input(format!(
                "cannot send while the worker is {:?}",
                self.status
            )));
        }
        if self.generating {
            return Err(ChatError::input("a generation is already in progress"));
        }
        if content.trim().is_empty() {
            return Err(ChatError::input("message is empty"));
        }

        self.history.push(SessionMessage {
            message: ChatMessage::user(content),
            timestamp: Local::now(),
            thinking: None,
        });
        self.generating = true;
        self.last_error = None;

        Ok(Command::generate(&clean_message_history(&self.messages())))
    }

    /// `interrupt` command, if there is anything to interrupt
    pub fn interrupt(&self) -> Option<Command> {
        self.generating.then_some(Command::Interrupt)
    }

    /// Forget the conversation and re-arm the orchestrator
    pub fn reset(&mut self) -> Command {
        self.history.clear();
        self.clear_buffers();
        self.generating = false;
        self.last_error = None;
        Command::Reset
    }

    pub fn apply(&mut self, message: StatusMessage) -> SessionEvent {
        match message {
            StatusMessage::Error { error, kind } => {
                let err = ChatError::from_wire(kind, error);
                if self.generating {
                    // The conversation survives a failed run
                    self.generating = false;
                    self.clear_buffers();
                } else {
                    self.status = WorkerStatus::Error;
                }
                self.last_error = Some(err.clone());
                SessionEvent::Failed(err)
            }
            StatusMessage::Ready { data } => {
                if let Some(data) = data {
                    debug!(%data, "worker ready");
                }
                self.status = WorkerStatus::Ready;
                self.progress.clear();
                self.last_error = None;
                SessionEvent::Status(WorkerStatus::Ready)
            }
            StatusMessage::Loading { data } => {
                self.status = WorkerStatus::Loading;
                SessionEvent::Loading(data)
            }
            StatusMessage::Progress {
                file,
                progress,
                total,
            } => self.apply_progress(file, progress, total),
            StatusMessage::Start => {
                self.generating = true;
                self.clear_buffers();
                SessionEvent::GenerationStarted
            }
            StatusMessage::Update {
                output,
                tps,
                num_tokens,
                state,
            } => {
                if !self.generating {
                    warn!("update received outside a generation run");
                    return SessionEvent::Ignored;
                }
                match state {
                    Phase::Thinking => self.thinking_buffer.push_str(&output),
                    Phase::Answering => self.answer_buffer.push_str(&output),
                }
                SessionEvent::Fragment {
                    text: output,
                    phase: state,
                    tps,
                    num_tokens,
                }
            }
            StatusMessage::Complete {
                output,
                interrupted,
            } => self.apply_complete(output, interrupted),
        }
    }

    fn apply_progress(&mut self, file: String, progress: f64, total: Option<u64>) -> SessionEvent {
        let redraw = match self.progress.get(&file) {
            None => true,
            Some(prev) => {
                (progress - prev.progress).abs() >= PROGRESS_STEP
                    || (progress >= 100.0 && prev.progress < 100.0)
            }
        };
        if !redraw {
            return SessionEvent::Ignored;
        }

        let total = total.or_else(|| self.progress.get(&file).and_then(|p| p.total));
        self.progress
            .insert(file.clone(), FileProgress { progress, total });
        SessionEvent::Progress {
            file,
            progress,
            total,
        }
    }

    fn apply_complete(&mut self, output: CompletionOutput, interrupted: bool) -> SessionEvent {
        self.generating = false;
        self.clear_buffers();
        self.candidates = output.candidates().into_iter().map(str::to_owned).collect();

        let Some(text) = output.canonical().filter(|t| !t.is_empty()) else {
            return SessionEvent::Ignored;
        };

        let mut text = text.to_owned();
        if interrupted && text.matches(thinking::OPEN).count() == text.matches(thinking::CLOSE).count() + 1 {
            // Stopped mid-thought: close the segment so the turn stays well-formed
            text.push_str(thinking::CLOSE);
        }

        if let Err(e) = validate_message_output(&text) {
            warn!(error = %e, "rejecting malformed completion");
            self.last_error = Some(e.clone());
            return SessionEvent::Failed(e);
        }

        let processed = process_message(&text);
        self.history.push(SessionMessage {
            message: ChatMessage::assistant(text),
            timestamp: Local::now(),
            thinking: (!processed.thinking.is_empty()).then(|| processed.thinking.clone()),
        });

        SessionEvent::Committed {
            answer: processed.answer,
            thinking: processed.thinking,
            interrupted,
        }
    }

    fn clear_buffers(&mut self) {
        self.thinking_buffer.clear();
        self.answer_buffer.clear();
    }
}
