//! Turns per-step token batches into ordered `update` events.

use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::error::ChatError;
use crate::protocol::StatusMessage;
use crate::runtime::{IncrementalUtf8Decoder, StreamControl, TokenId, TokenStreamer, Tokenizer};

use super::interrupt::InterruptToken;
use super::state::GenerationRun;

/// Streamer handed to the model for one generation run.
///
/// Emits exactly one `update` per batch, in production order, carrying only
/// the newly decoded fragment. Once the interrupt token is tripped nothing
/// more is emitted and the model is told to stop.
pub struct StreamingEmitter {
    tokenizer: Arc<dyn Tokenizer>,
    run: GenerationRun,
    decoder: IncrementalUtf8Decoder,
    events: mpsc::UnboundedSender<StatusMessage>,
    interrupt: InterruptToken,
    error: Option<ChatError>,
    stopped_by_interrupt: bool,
}

impl StreamingEmitter {
    pub fn new(
        tokenizer: Arc<dyn Tokenizer>,
        sentinel: TokenId,
        events: mpsc::UnboundedSender<StatusMessage>,
        interrupt: InterruptToken,
    ) -> Self {
        Self {
            tokenizer,
            run: GenerationRun::new(sentinel),
            decoder: IncrementalUtf8Decoder::new(),
            events,
            interrupt,
            error: None,
            stopped_by_interrupt: false,
        }
    }

    /// Error that made the emitter stop the model, if any
    pub fn take_error(&mut self) -> Option<ChatError> {
        self.error.take()
    }

    /// Whether the run ended because the interrupt token was tripped
    pub fn interrupted(&self) -> bool {
        self.stopped_by_interrupt
    }

    pub fn run(&self) -> &GenerationRun {
        &self.run
    }
}

impl TokenStreamer for StreamingEmitter {
    fn put(&mut self, tokens: &[TokenId]) -> StreamControl {
        if self.error.is_some() {
            return StreamControl::Stop;
        }
        if self.interrupt.is_interrupted() {
            debug!(num_tokens = self.run.num_tokens(), "interrupt observed; suppressing further updates");
            self.stopped_by_interrupt = true;
            return StreamControl::Stop;
        }

        let state = self.run.observe(tokens, Instant::now());

        let tokenizer = &self.tokenizer;
        let output = match self
            .decoder
            .push_tokens(tokens, |ids| tokenizer.decode(ids, true))
        {
            Ok(fragment) => fragment,
            Err(e) => {
                self.error = Some(ChatError::generation(format!("decode failed: {e:#}")));
                return StreamControl::Stop;
            }
        };
        self.run.push_output(&output);

        trace!(?tokens, %output, ?state, "update");
        let update = StatusMessage::Update {
            output,
            tps: self.run.tps(),
            num_tokens: self.run.num_tokens(),
            state,
        };
        if self.events.send(update).is_err() {
            self.error = Some(ChatError::channel("status receiver dropped"));
            return StreamControl::Stop;
        }

        StreamControl::Continue
    }

    fn end(&mut self) {
        debug!(
            num_tokens = self.run.num_tokens(),
            tps = ?self.run.tps(),
            phase = ?self.run.phase(),
            "stream ended"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Phase;
    use crate::runtime::scripted::{ScriptedTokenizer, THINK_CLOSE_ID};

    fn updates(rx: &mut mpsc::UnboundedReceiver<StatusMessage>) -> Vec<(String, usize, Phase)> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            match msg {
                StatusMessage::Update {
                    output,
                    num_tokens,
                    state,
                    ..
                } => out.push((output, num_tokens, state)),
                other => panic!("unexpected event {other:?}"),
            }
        }
        out
    }

    #[test]
    fn test_one_update_per_batch_in_order() {
        let tokenizer = Arc::new(ScriptedTokenizer::new());
        let ids = tokenizer.encode("<think>hmm</think> yes", false).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut emitter = StreamingEmitter::new(tokenizer.clone(), THINK_CLOSE_ID, tx, InterruptToken::new());

        for id in &ids {
            assert_eq!(emitter.put(&[*id]), StreamControl::Continue);
        }

        let got = updates(&mut rx);
        assert_eq!(got.len(), ids.len());
        let text: String = got.iter().map(|(o, _, _)| o.as_str()).collect();
        assert_eq!(text, "<think>hmm</think> yes");
        assert!(got.windows(2).all(|w| w[0].1 < w[1].1));
        assert_eq!(got[0].2, Phase::Thinking);
        assert_eq!(got.last().map(|u| u.2), Some(Phase::Answering));
        assert_eq!(emitter.run().output(), "<think>hmm</think> yes");
    }

    #[test]
    fn test_interrupt_suppresses_updates() {
        let tokenizer = Arc::new(ScriptedTokenizer::new());
        let ids = tokenizer.encode("a b c", false).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let token = InterruptToken::new();
        let mut emitter = StreamingEmitter::new(tokenizer, THINK_CLOSE_ID, tx, token.clone());

        assert_eq!(emitter.put(&ids[..1]), StreamControl::Continue);
        token.interrupt();
        assert_eq!(emitter.put(&ids[1..2]), StreamControl::Stop);

        assert_eq!(updates(&mut rx).len(), 1);
        assert!(emitter.interrupted());
        assert!(emitter.take_error().is_none());
    }

    #[test]
    fn test_decode_failure_stops_with_generation_error() {
        let tokenizer = Arc::new(ScriptedTokenizer::new());
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut emitter = StreamingEmitter::new(tokenizer, THINK_CLOSE_ID, tx, InterruptToken::new());

        assert_eq!(emitter.put(&[424_242]), StreamControl::Stop);
        let err = emitter.take_error().unwrap();
        assert!(matches!(err, ChatError::Generation(_)));
    }

    #[test]
    fn test_closed_channel_stops() {
        let tokenizer = Arc::new(ScriptedTokenizer::new());
        let ids = tokenizer.encode("a", false).unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let mut emitter = StreamingEmitter::new(tokenizer, THINK_CLOSE_ID, tx, InterruptToken::new());
        assert_eq!(emitter.put(&ids), StreamControl::Stop);
    }
}
