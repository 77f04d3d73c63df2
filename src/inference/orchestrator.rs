//! Command-processing actor that owns the backend.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │        OrchestratorClient / CommandSender        │
//! │  - commands: mpsc::UnboundedSender<Command>     │
//! │  - events:   mpsc::UnboundedReceiver<Status>    │
//! └───────────────────────┬─────────────────────────┘
//!                         │ commands ▼   ▲ status events
//! ┌─────────────────────────────────────────────────┐
//! │                 Orchestrator                     │
//! │  - BackendHandle (single-flight)                │
//! │  - InterruptToken                               │
//! │  - model.generate() on the blocking pool        │
//! └─────────────────────────────────────────────────┘
//! ```
//!
//! Commands are processed one at a time. While a command is suspended on
//! backend resolution or generation, `interrupt` and `reset` are applied
//! immediately; any other command waits until the current one finishes.
//! An `interrupt` also sticks to every `generate` already waiting, which then
//! completes without producing a token unless a `reset` follows.

use serde_json::Value;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::config::{BackendKind, CapabilityConfig, GenerationConfig, ThinkstreamConfig};
use crate::constants::{labels, thinking};
use crate::error::{ChatError, Result};
use crate::protocol::{parse_conversation, Command, CompletionOutput, StatusMessage};
use crate::runtime::{
    AccelerationProbe, BackendLoader, EnvironmentProbe, GenerateOptions, LoadEvent, NullStreamer,
    ProgressSink, ScriptedLoader, TokenId, Tokenizer,
};

use super::client::OrchestratorClient;
use super::handle::BackendHandle;
use super::interrupt::InterruptToken;
use super::streamer::StreamingEmitter;

pub struct Orchestrator {
    handle: Arc<BackendHandle>,
    interrupt: InterruptToken,
    probe: Arc<dyn AccelerationProbe>,
    generation: GenerationConfig,
    capability: CapabilityConfig,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<StatusMessage>,
    /// Commands that arrived while another command was suspended
    deferred: VecDeque<Queued>,
}

/// A deferred command and whether an `interrupt` sent after it has already
/// been seen
#[derive(Debug)]
struct Queued {
    command: Command,
    interrupted: bool,
}

pub struct OrchestratorBuilder {
    loader: Arc<dyn BackendLoader>,
    probe: Arc<dyn AccelerationProbe>,
    generation: GenerationConfig,
    capability: CapabilityConfig,
}

impl OrchestratorBuilder {
    pub fn probe<P: AccelerationProbe + 'static>(mut self, probe: P) -> Self {
        self.probe = Arc::new(probe);
        self
    }

    pub fn generation(mut self, generation: GenerationConfig) -> Self {
        self.generation = generation;
        self
    }

    pub fn capability(mut self, capability: CapabilityConfig) -> Self {
        self.capability = capability;
        self
    }

    /// Create the orchestrator and its client without starting it.
    ///
    /// The caller drives [`Orchestrator::run`] on a runtime of its choice.
    pub fn build(self) -> (Orchestrator, OrchestratorClient) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let handle = BackendHandle::new(self.loader, progress_sink(event_tx.clone()));
        let orchestrator = Orchestrator {
            handle: Arc::new(handle),
            interrupt: InterruptToken::new(),
            probe: self.probe,
            generation: self.generation,
            capability: self.capability,
            commands: command_rx,
            events: event_tx,
            deferred: VecDeque::new(),
        };

        (orchestrator, OrchestratorClient::new(command_tx, event_rx))
    }

    /// Start the orchestrator on a dedicated thread with its own runtime.
    pub fn spawn(self) -> Result<OrchestratorClient> {
        let (orchestrator, client) = self.build();

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| ChatError::channel(format!("failed to create orchestrator runtime: {e}")))?;

        std::thread::Builder::new()
            .name("thinkstream-orchestrator".to_owned())
            .spawn(move || runtime.block_on(orchestrator.run()))
            .map_err(|e| ChatError::channel(format!("failed to spawn orchestrator thread: {e}")))?;

        Ok(client)
    }
}

impl Orchestrator {
    pub fn builder(loader: Arc<dyn BackendLoader>) -> OrchestratorBuilder {
        OrchestratorBuilder {
            loader,
            probe: Arc::new(EnvironmentProbe::default()),
            generation: GenerationConfig::default(),
            capability: CapabilityConfig::default(),
        }
    }

    /// Builder wired from configuration: backend kind, probe paths, limits
    pub fn from_config(config: &ThinkstreamConfig) -> OrchestratorBuilder {
        let loader: Arc<dyn BackendLoader> = match config.backend.kind {
            BackendKind::Scripted => Arc::new(
                ScriptedLoader::new(config.scripted.clone()).with_backend(config.backend.clone()),
            ),
        };
        info!(loader = %loader.describe(), "configuring backend");

        Self::builder(loader)
            .probe(EnvironmentProbe::with_extra_paths(
                config.capability.extra_device_paths.clone(),
            ))
            .generation(config.generation.clone())
            .capability(config.capability.clone())
    }

    /// Process commands until every sender is dropped.
    pub async fn run(mut self) {
        info!("orchestrator started");
        loop {
            let queued = match self.deferred.pop_front() {
                Some(queued) => queued,
                None => match self.commands.recv().await {
                    Some(command) => Queued {
                        command,
                        interrupted: false,
                    },
                    None => break,
                },
            };
            self.handle_command(queued.command, queued.interrupted).await;
        }
        info!("orchestrator stopped");
    }

    #[instrument(skip_all, fields(command = command.name(), interrupted = interrupted))]
    async fn handle_command(&mut self, command: Command, interrupted: bool) {
        debug!("processing command");
        let result = match command {
            Command::Check => self.handle_check(),
            Command::Load => self.handle_load().await,
            Command::Generate { data } => self.handle_generate(data, interrupted).await,
            Command::Interrupt => {
                self.interrupt.interrupt();
                Ok(())
            }
            Command::Reset => {
                self.interrupt.reset();
                Ok(())
            }
        };

        if let Err(e) = result {
            self.emit_error(&e);
        }
    }

    fn handle_check(&self) -> Result<()> {
        match self.probe.probe() {
            Ok(adapter) => {
                info!(adapter = %adapter.name, "GPU acceleration available");
                self.emit(StatusMessage::Ready {
                    data: Some(format!("GPU acceleration is supported ({})", adapter.name)),
                });
                Ok(())
            }
            Err(e) if !self.capability.require_gpu => {
                warn!(error = %e, "GPU acceleration unavailable; continuing without it");
                self.emit(StatusMessage::Ready {
                    data: Some("GPU acceleration not detected; running without it".to_owned()),
                });
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn handle_load(&mut self) -> Result<()> {
        if self.capability.require_gpu {
            self.probe.probe()?;
        }

        self.emit(StatusMessage::loading(labels::LOADING_MODEL));
        let backend = self.resolve_backend().await?;

        self.emit(StatusMessage::loading(labels::COMPILING));
        self.emit(StatusMessage::loading(labels::WARMING_UP));

        let options = GenerateOptions {
            max_new_tokens: self.generation.warmup_max_new_tokens,
            stopping: None,
        };
        let warmup = tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            let input_ids = backend.tokenizer.encode("a", true)?;
            backend.model.generate(&input_ids, &options, &mut NullStreamer)?;
            Ok(())
        });

        match self.drive(warmup).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(ChatError::resolution(format!("warm-up failed: {e:#}"))),
            Err(e) => return Err(ChatError::resolution(format!("warm-up task failed: {e}"))),
        }

        info!("backend loaded and warmed up");
        self.emit(StatusMessage::ready());
        Ok(())
    }

    /// `interrupted` is set when an `interrupt` sent after this command
    /// arrived while it was still queued; the run then stops before its
    /// first token.
    async fn handle_generate(&mut self, data: Value, interrupted: bool) -> Result<()> {
        self.interrupt.reset();
        if interrupted {
            info!("generation was interrupted while queued");
            self.interrupt.interrupt();
        }
        let messages = parse_conversation(data)?;
        info!(messages = messages.len(), "starting generation");

        let backend = self.resolve_backend().await?;

        let input_ids = backend
            .tokenizer
            .apply_chat_template(&messages, true)
            .map_err(|e| ChatError::generation(format!("chat template failed: {e:#}")))?;
        let prompt_len = input_ids.len();
        let sentinel = end_of_thinking_id(backend.tokenizer.as_ref())?;
        debug!(prompt_len, sentinel, "prompt prepared");

        self.emit(StatusMessage::Start);

        let emitter = StreamingEmitter::new(
            backend.tokenizer.clone(),
            sentinel,
            self.events.clone(),
            self.interrupt.clone(),
        );
        let options = GenerateOptions {
            max_new_tokens: self.generation.max_new_tokens,
            stopping: Some(self.interrupt.clone()),
        };
        let model = backend.model.clone();
        let task = tokio::task::spawn_blocking(move || {
            let mut emitter = emitter;
            let result = model.generate(&input_ids, &options, &mut emitter);
            (result, emitter)
        });

        let (result, mut emitter) = self
            .drive(task)
            .await
            .map_err(|e| ChatError::generation(format!("generation task failed: {e}")))?;

        if let Some(e) = emitter.take_error() {
            return Err(e);
        }
        let sequences = result.map_err(|e| ChatError::generation(format!("{e:#}")))?;
        if sequences.is_empty() {
            return Err(ChatError::generation("No sequences generated"));
        }

        let decoded = decode_generated(backend.tokenizer.as_ref(), &sequences, prompt_len)?;
        let interrupted = emitter.interrupted() || self.interrupt.is_interrupted();

        info!(
            candidates = decoded.len(),
            num_tokens = emitter.run().num_tokens(),
            tps = ?emitter.run().tps(),
            interrupted,
            "generation complete"
        );
        self.emit(StatusMessage::Complete {
            output: CompletionOutput::Sequences(decoded),
            interrupted,
        });
        Ok(())
    }

    async fn resolve_backend(&mut self) -> Result<crate::runtime::Backend> {
        let handle = self.handle.clone();
        self.drive(async move { handle.get_instance().await }).await
    }

    /// Await `fut` while still servicing `interrupt` and `reset`.
    ///
    /// Both act on the running command at once. They also apply to every
    /// `generate` already queued, so a queued run cannot reset away an
    /// `interrupt` that was sent after it.
    async fn drive<F: Future>(&mut self, fut: F) -> F::Output {
        tokio::pin!(fut);
        let mut commands_open = true;
        loop {
            tokio::select! {
                biased;
                output = &mut fut => return output,
                command = self.commands.recv(), if commands_open => match command {
                    Some(Command::Interrupt) => {
                        info!("interrupt requested");
                        self.interrupt.interrupt();
                        self.mark_queued_generations(true);
                    }
                    Some(Command::Reset) => {
                        self.interrupt.reset();
                        self.mark_queued_generations(false);
                    }
                    Some(other) => {
                        debug!(command = other.name(), "deferring command until current one finishes");
                        self.deferred.push_back(Queued {
                            command: other,
                            interrupted: false,
                        });
                    }
                    None => commands_open = false,
                },
            }
        }
    }

    fn mark_queued_generations(&mut self, interrupted: bool) {
        for queued in &mut self.deferred {
            if matches!(queued.command, Command::Generate { .. }) {
                queued.interrupted = interrupted;
            }
        }
    }

    fn emit(&self, message: StatusMessage) {
        trace!(status = message.name(), "emit");
        if self.events.send(message).is_err() {
            debug!("status receiver dropped");
        }
    }

    fn emit_error(&self, err: &ChatError) {
        error!(kind = ?err.kind(), error = %err, "command failed");
        self.emit(StatusMessage::from(err));
    }
}

/// Second id of the encoded `<think></think>` probe
fn end_of_thinking_id(tokenizer: &dyn Tokenizer) -> Result<TokenId> {
    let ids = tokenizer
        .encode(thinking::SENTINEL_PROBE, false)
        .map_err(|e| ChatError::generation(format!("failed to encode thinking markers: {e:#}")))?;
    ids.get(1)
        .copied()
        .ok_or_else(|| ChatError::generation("tokenizer does not encode the thinking markers as separate tokens"))
}

/// Decode only the generated tail of every candidate sequence
fn decode_generated(tokenizer: &dyn Tokenizer, sequences: &[Vec<TokenId>], prompt_len: usize) -> Result<Vec<String>> {
    let tails = sequences
        .iter()
        .map(|seq| {
            seq.get(prompt_len..).map(<[TokenId]>::to_vec).ok_or_else(|| {
                ChatError::generation(format!(
                    "Invalid model output format: sequence of {} tokens is shorter than the {}-token prompt",
                    seq.len(),
                    prompt_len
                ))
            })
        })
        .collect::<Result<Vec<_>>>()?;

    tokenizer
        .batch_decode(&tails, true)
        .map_err(|e| ChatError::generation(format!("decode failed: {e:#}")))
}

/// Forward loader events as `progress`/`loading` status messages
fn progress_sink(events: mpsc::UnboundedSender<StatusMessage>) -> ProgressSink {
    Arc::new(move |event: LoadEvent| {
        let message = match event {
            LoadEvent::Initiate { file } => StatusMessage::Progress {
                file,
                progress: 0.0,
                total: None,
            },
            LoadEvent::Download { file, progress, total } => StatusMessage::Progress {
                file,
                progress: progress.clamp(0.0, 100.0),
                total,
            },
            LoadEvent::Done { file } => StatusMessage::Progress {
                file,
                progress: 100.0,
                total: None,
            },
            LoadEvent::Other { status, file } => StatusMessage::loading(format!("{status}: {file}")),
        };
        let _ = events.send(message);
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScriptedConfig;
    use crate::error::ErrorKind;
    use crate::protocol::{ChatMessage, Phase};
    use crate::runtime::StaticProbe;

    fn scripted(reply: &str) -> Arc<dyn BackendLoader> {
        Arc::new(ScriptedLoader::new(ScriptedConfig {
            reply: reply.to_owned(),
            token_delay_ms: 0,
            load_delay_ms: 0,
            ..Default::default()
        }))
    }

    fn start(loader: Arc<dyn BackendLoader>) -> OrchestratorClient {
        let (orchestrator, client) = Orchestrator::builder(loader)
            .probe(StaticProbe::available("test-gpu"))
            .build();
        tokio::spawn(orchestrator.run());
        client
    }

    #[tokio::test]
    async fn test_check_reports_adapter() {
        let mut client = start(scripted("hi"));
        client.check().unwrap();
        match client.next_event().await {
            Some(StatusMessage::Ready { data: Some(data) }) => assert!(data.contains("test-gpu")),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_check_without_gpu() {
        let (orchestrator, mut client) = Orchestrator::builder(scripted("hi"))
            .probe(StaticProbe::unavailable())
            .build();
        tokio::spawn(orchestrator.run());

        client.check().unwrap();
        match client.next_event().await {
            Some(StatusMessage::Error { kind, .. }) => assert_eq!(kind, Some(ErrorKind::Capability)),
            other => panic!("unexpected event {other:?}"),
        }

        // load refuses too
        client.load().unwrap();
        let events = client.collect_until_terminal().await;
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], StatusMessage::Error { .. }));
    }

    #[tokio::test]
    async fn test_optional_gpu_downgrades_to_warning() {
        let (orchestrator, mut client) = Orchestrator::builder(scripted("hi"))
            .probe(StaticProbe::unavailable())
            .capability(CapabilityConfig {
                require_gpu: false,
                extra_device_paths: Vec::new(),
            })
            .build();
        tokio::spawn(orchestrator.run());

        client.check().unwrap();
        assert!(matches!(client.next_event().await, Some(StatusMessage::Ready { .. })));

        client.load().unwrap();
        let events = client.collect_until_terminal().await;
        assert!(matches!(events.last(), Some(StatusMessage::Ready { data: None })));
    }

    #[tokio::test]
    async fn test_load_sequence() {
        let mut client = start(scripted("hi"));
        client.load().unwrap();
        let events = client.collect_until_terminal().await;

        let labels: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                StatusMessage::Loading { data } => Some(data.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(labels, vec![labels::LOADING_MODEL, labels::COMPILING, labels::WARMING_UP]);
        assert!(events.iter().any(|e| matches!(e, StatusMessage::Progress { .. })));
        assert!(matches!(events.last(), Some(StatusMessage::Ready { data: None })));
    }

    #[tokio::test]
    async fn test_generate_streams_then_completes() {
        let mut client = start(scripted("<think>\nok\n</think>\n\nDone."));
        client.generate(&[ChatMessage::user("hello")]).unwrap();
        let events: Vec<StatusMessage> = client
            .collect_until_terminal()
            .await
            .into_iter()
            .filter(|e| !matches!(e, StatusMessage::Progress { .. }))
            .collect();

        assert!(matches!(events.first(), Some(StatusMessage::Start)));
        let phases: Vec<Phase> = events
            .iter()
            .filter_map(|e| match e {
                StatusMessage::Update { state, .. } => Some(*state),
                _ => None,
            })
            .collect();
        assert!(!phases.is_empty());
        assert_eq!(phases[0], Phase::Thinking);
        assert_eq!(phases.last(), Some(&Phase::Answering));

        match events.last() {
            Some(StatusMessage::Complete { output, interrupted }) => {
                assert!(!interrupted);
                assert_eq!(output.canonical(), Some("<think>\nok\n</think>\n\nDone."));
            }
            other => panic!("unexpected terminal event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_generate_rejects_non_array() {
        let mut client = start(scripted("hi"));
        client
            .send(Command::Generate {
                data: serde_json::json!({"role": "user", "content": "hi"}),
            })
            .unwrap();
        let events = client.collect_until_terminal().await;
        assert_eq!(events.len(), 1);
        match &events[0] {
            StatusMessage::Error { error, kind } => {
                assert_eq!(*kind, Some(ErrorKind::Input));
                assert!(error.contains("Invalid message data for generate command"));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_mid_stream_failure_has_no_complete() {
        let loader: Arc<dyn BackendLoader> = Arc::new(ScriptedLoader::new(ScriptedConfig {
            reply: "one two three four".to_owned(),
            token_delay_ms: 0,
            load_delay_ms: 0,
            fail_after_tokens: Some(2),
            ..Default::default()
        }));
        let mut client = start(loader);
        client.generate(&[ChatMessage::user("hello")]).unwrap();
        let events = client.collect_until_terminal().await;

        assert!(matches!(
            events.iter().find(|e| !matches!(e, StatusMessage::Progress { .. })),
            Some(StatusMessage::Start)
        ));
        let updates = events
            .iter()
            .filter(|e| matches!(e, StatusMessage::Update { .. }))
            .count();
        assert_eq!(updates, 2);
        assert!(!events.iter().any(|e| matches!(e, StatusMessage::Complete { .. })));
        match events.last() {
            Some(StatusMessage::Error { kind, .. }) => assert_eq!(*kind, Some(ErrorKind::Generation)),
            other => panic!("unexpected terminal event {other:?}"),
        }
    }

    #[test]
    fn test_progress_mapping() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = progress_sink(tx);
        sink(LoadEvent::Download {
            file: "model.onnx".into(),
            progress: 142.0,
            total: Some(10),
        });
        sink(LoadEvent::Other {
            status: "compile".into(),
            file: "model.onnx".into(),
        });

        assert_eq!(
            rx.try_recv().unwrap(),
            StatusMessage::Progress {
                file: "model.onnx".into(),
                progress: 100.0,
                total: Some(10)
            }
        );
        assert_eq!(rx.try_recv().unwrap(), StatusMessage::loading("compile: model.onnx"));
    }
}
