//! Client handles for the orchestrator.
//!
//! `CommandSender` is cheap to clone and can be handed to any task (a Ctrl-C
//! handler, a stdin reader). `OrchestratorClient` additionally owns the single
//! status event receiver.

use futures::Stream;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::error::{ChatError, Result};
use crate::protocol::{ChatMessage, Command, StatusMessage};

#[derive(Debug, Clone)]
pub struct CommandSender {
    sender: mpsc::UnboundedSender<Command>,
}

impl CommandSender {
    pub fn send(&self, command: Command) -> Result<()> {
        self.sender
            .send(command)
            .map_err(|_| ChatError::channel("orchestrator has stopped"))
    }

    pub fn check(&self) -> Result<()> {
        self.send(Command::Check)
    }

    pub fn load(&self) -> Result<()> {
        self.send(Command::Load)
    }

    pub fn generate(&self, messages: &[ChatMessage]) -> Result<()> {
        self.send(Command::generate(messages))
    }

    /// Send an unvalidated `generate` payload
    pub fn generate_raw(&self, data: Value) -> Result<()> {
        self.send(Command::Generate { data })
    }

    pub fn interrupt(&self) -> Result<()> {
        self.send(Command::Interrupt)
    }

    pub fn reset(&self) -> Result<()> {
        self.send(Command::Reset)
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

pub struct OrchestratorClient {
    commands: CommandSender,
    events: mpsc::UnboundedReceiver<StatusMessage>,
}

impl OrchestratorClient {
    pub(crate) fn new(
        sender: mpsc::UnboundedSender<Command>,
        events: mpsc::UnboundedReceiver<StatusMessage>,
    ) -> Self {
        Self {
            commands: CommandSender { sender },
            events,
        }
    }

    /// A clone of the command side
    pub fn sender(&self) -> CommandSender {
        self.commands.clone()
    }

    pub fn send(&self, command: Command) -> Result<()> {
        self.commands.send(command)
    }

    pub fn check(&self) -> Result<()> {
        self.commands.check()
    }

    pub fn load(&self) -> Result<()> {
        self.commands.load()
    }

    pub fn generate(&self, messages: &[ChatMessage]) -> Result<()> {
        self.commands.generate(messages)
    }

    pub fn interrupt(&self) -> Result<()> {
        self.commands.interrupt()
    }

    pub fn reset(&self) -> Result<()> {
        self.commands.reset()
    }

    /// Next status event; `None` once the orchestrator has stopped.
    pub async fn next_event(&mut self) -> Option<StatusMessage> {
        self.events.recv().await
    }

    /// Collect events up to and including the next `ready`, `complete` or
    /// `error`, the events that end a `check`, `load` or `generate`.
    pub async fn collect_until_terminal(&mut self) -> Vec<StatusMessage> {
        let mut collected = Vec::new();
        while let Some(event) = self.events.recv().await {
            let done = matches!(
                event,
                StatusMessage::Ready { .. } | StatusMessage::Complete { .. } | StatusMessage::Error { .. }
            );
            collected.push(event);
            if done {
                break;
            }
        }
        collected
    }

    pub fn split(self) -> (CommandSender, mpsc::UnboundedReceiver<StatusMessage>) {
        (self.commands, self.events)
    }

    /// Event side as a `Stream`
    pub fn into_stream(self) -> (CommandSender, impl Stream<Item = StatusMessage>) {
        (self.commands, UnboundedReceiverStream::new(self.events))
    }
}
