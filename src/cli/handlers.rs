//! Handlers behind the `serve`, `chat` and `check` subcommands.

use anyhow::{bail, Context, Result};
use std::io::Write as _;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};

use crate::chat::{ChatSession, SessionEvent, WorkerStatus};
use crate::config::ThinkstreamConfig;
use crate::constants::thinking;
use crate::error::ChatError;
use crate::inference::{Orchestrator, OrchestratorClient};
use crate::protocol::codec::{decode_command, encode_line};
use crate::protocol::{Phase, StatusMessage};

use super::commands::{ChatCommand, CheckCommand, ServeCommand};

pub async fn handle_serve(mut config: ThinkstreamConfig, cmd: ServeCommand) -> Result<()> {
    if cmd.allow_cpu {
        config.capability.require_gpu = false;
    }

    let client = Orchestrator::from_config(&config).spawn()?;
    if cmd.preload {
        client.check()?;
        client.load()?;
    }

    info!(model_id = %config.backend.model_id, "serving JSON lines on stdin/stdout");
    serve_lines(client, BufReader::new(tokio::io::stdin()), tokio::io::stdout()).await
}

/// Pump commands from `input` into the orchestrator and status events into
/// `output`, one JSON document per line.
///
/// Lines that do not parse are answered with an error event. Once `input`
/// ends, events keep flowing until the orchestrator has finished every
/// queued command.
pub async fn serve_lines<R, W>(client: OrchestratorClient, input: R, mut output: W) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let (sender, mut events) = client.split();
    let mut sender = Some(sender);
    let mut lines = input.lines();

    loop {
        tokio::select! {
            line = lines.next_line(), if sender.is_some() => {
                match line.context("failed to read command line")? {
                    Some(line) if line.trim().is_empty() => {}
                    Some(line) => match decode_command(&line) {
                        Ok(command) => {
                            debug!(command = command.name(), "received command");
                            if let Some(sender) = &sender {
                                sender.send(command)?;
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "rejecting input line");
                            write_status(&mut output, &StatusMessage::from(&e)).await?;
                        }
                    },
                    None => {
                        info!("input closed, draining pending events");
                        sender = None;
                    }
                }
            }
            event = events.recv() => match event {
                Some(event) => write_status(&mut output, &event).await?,
                None => break,
            },
        }
    }

    output.flush().await?;
    Ok(())
}

async fn write_status<W: AsyncWrite + Unpin>(output: &mut W, status: &StatusMessage) -> Result<()> {
    let mut line = encode_line(status)?;
    line.push('\n');
    output.write_all(line.as_bytes()).await?;
    output.flush().await?;
    Ok(())
}

pub async fn handle_check(mut config: ThinkstreamConfig, cmd: CheckCommand) -> Result<()> {
    // Report the probe as is, whatever the config tolerates
    config.capability.require_gpu = true;

    let mut client = Orchestrator::from_config(&config).spawn()?;
    client.check()?;

    let events = client.collect_until_terminal().await;
    let Some(last) = events.last() else {
        bail!("orchestrator stopped before answering");
    };

    if cmd.json {
        for event in &events {
            println!("{}", encode_line(event)?);
        }
    }

    match last {
        StatusMessage::Ready { data } => {
            if !cmd.json {
                println!("{}", data.as_deref().unwrap_or("ready"));
            }
            Ok(())
        }
        StatusMessage::Error { error, kind } => Err(ChatError::from_wire(*kind, error.clone()).into()),
        other => bail!("unexpected {} event in reply to check", other.name()),
    }
}

pub async fn handle_chat(mut config: ThinkstreamConfig, cmd: ChatCommand) -> Result<()> {
    if cmd.allow_cpu {
        config.capability.require_gpu = false;
    }

    let mut client = Orchestrator::from_config(&config).spawn()?;
    let mut session = ChatSession::new();
    let mut renderer = Renderer::new(&cmd);

    client.check()?;
    await_setup(&mut client, &mut session, &mut renderer).await?;
    client.load()?;
    await_setup(&mut client, &mut session, &mut renderer).await?;

    println!("Model ready. /reset clears the conversation, /exit quits, Ctrl-C interrupts an answer.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush()?;

        let line = tokio::select! {
            line = lines.next_line() => line.context("failed to read from stdin")?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            println!();
            break;
        };

        match line.trim() {
            "" => continue,
            "/exit" | "/quit" => break,
            "/reset" => {
                client.send(session.reset())?;
                println!("(conversation cleared)");
                continue;
            }
            _ => {}
        }

        let command = match session.prepare_generate(line.trim()) {
            Ok(command) => command,
            Err(e) => {
                eprintln!("{e}");
                continue;
            }
        };
        client.send(command)?;

        loop {
            tokio::select! {
                event = client.next_event() => {
                    let Some(event) = event else {
                        bail!("orchestrator stopped unexpectedly");
                    };
                    let terminal = event.is_terminal();
                    let update = session.apply(event);
                    renderer.render(&update)?;
                    if terminal {
                        break;
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    if let Some(command) = session.interrupt() {
                        client.send(command)?;
                    }
                }
            }
        }
    }

    info!(turns = session.history().len(), "chat finished");
    Ok(())
}

/// Apply events until the pending `check` or `load` settles.
async fn await_setup(
    client: &mut OrchestratorClient,
    session: &mut ChatSession,
    renderer: &mut Renderer,
) -> Result<()> {
    while let Some(event) = client.next_event().await {
        let settles = matches!(event, StatusMessage::Ready { .. } | StatusMessage::Error { .. });
        let update = session.apply(event);
        renderer.render(&update)?;
        if settles {
            return match update {
                SessionEvent::Failed(e) => Err(e.into()),
                _ => Ok(()),
            };
        }
    }
    bail!("orchestrator stopped unexpectedly")
}

/// Terminal rendering of session events
struct Renderer {
    hide_thinking: bool,
    show_tps: bool,
    phase: Option<Phase>,
    last_tps: Option<f64>,
}

impl Renderer {
    fn new(cmd: &ChatCommand) -> Self {
        Self {
            hide_thinking: cmd.hide_thinking,
            show_tps: cmd.show_tps,
            phase: None,
            last_tps: None,
        }
    }

    fn render(&mut self, event: &SessionEvent) -> Result<()> {
        let mut out = std::io::stdout().lock();
        match event {
            SessionEvent::Loading(label) => writeln!(out, "{label}")?,
            SessionEvent::Progress { file, progress, .. } => writeln!(out, "  {file}: {progress:.0}%")?,
            SessionEvent::Status(WorkerStatus::Error) => writeln!(out, "worker unavailable")?,
            SessionEvent::Status(_) | SessionEvent::Ignored => {}
            SessionEvent::GenerationStarted => {
                self.phase = None;
                self.last_tps = None;
            }
            SessionEvent::Fragment { text, phase, tps, .. } => {
                if self.phase == Some(Phase::Thinking) && *phase == Phase::Answering && !self.hide_thinking {
                    writeln!(out, "\n")?;
                }
                if !(self.hide_thinking && *phase == Phase::Thinking) {
                    let text = text.replace(thinking::OPEN, "").replace(thinking::CLOSE, "");
                    write!(out, "{text}")?;
                }
                self.phase = Some(*phase);
                if tps.is_some() {
                    self.last_tps = *tps;
                }
                out.flush()?;
            }
            SessionEvent::Committed { interrupted, .. } => {
                writeln!(out)?;
                if *interrupted {
                    writeln!(out, "[interrupted]")?;
                }
                if let (true, Some(tps)) = (self.show_tps, self.last_tps) {
                    writeln!(out, "({tps:.1} tokens/s)")?;
                }
            }
            SessionEvent::Failed(e) => {
                writeln!(out)?;
                eprintln!("error: {e}");
            }
        }
        Ok(())
    }
}
