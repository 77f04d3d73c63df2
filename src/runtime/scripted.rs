//! Deterministic reference backend.
//!
//! `ScriptedTokenizer` splits text into whitespace-prefixed word pieces and
//! recognises the DeepSeek-R1 delimiters and thinking markers as single
//! tokens, so encode/decode round-trips exactly. `ScriptedModel` replays a
//! configured reply one token per step, honouring the interrupt token and the
//! streamer's stop signal the same way a real autoregressive loop would.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace};

use crate::config::{BackendConfig, ScriptedConfig, ScriptedFile};
use crate::constants::{delimiters, thinking};
use crate::protocol::ChatMessage;

use super::template_engine::ChatTemplate;
use super::{
    BackendLoader, GenerateOptions, LoadEvent, Model, ProgressSink, StreamControl, TokenId,
    TokenStreamer, Tokenizer,
};

pub const BOS_ID: TokenId = 0;
pub const EOS_ID: TokenId = 1;
pub const USER_ID: TokenId = 2;
pub const ASSISTANT_ID: TokenId = 3;
pub const THINK_OPEN_ID: TokenId = 4;
pub const THINK_CLOSE_ID: TokenId = 5;

/// Pieces matched before word splitting, with their fixed ids
const RESERVED: [(&str, TokenId, bool); 6] = [
    (delimiters::BOS, BOS_ID, true),
    (delimiters::EOS, EOS_ID, true),
    (delimiters::USER, USER_ID, true),
    (delimiters::ASSISTANT, ASSISTANT_ID, true),
    (thinking::OPEN, THINK_OPEN_ID, false),
    (thinking::CLOSE, THINK_CLOSE_ID, false),
];

#[derive(Debug, Default)]
struct Vocab {
    pieces: Vec<String>,
    ids: HashMap<String, TokenId>,
}

impl Vocab {
    fn with_reserved() -> Self {
        let mut vocab = Self::default();
        for (piece, id, _) in RESERVED {
            debug_assert_eq!(id as usize, vocab.pieces.len());
            vocab.pieces.push(piece.to_owned());
            vocab.ids.insert(piece.to_owned(), id);
        }
        vocab
    }
}

/// Word-piece tokenizer with an open, interning vocabulary
pub struct ScriptedTokenizer {
    vocab: RwLock<Vocab>,
    template: ChatTemplate,
}

impl Default for ScriptedTokenizer {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedTokenizer {
    pub fn new() -> Self {
        Self {
            vocab: RwLock::new(Vocab::with_reserved()),
            template: ChatTemplate::deepseek_r1(),
        }
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab.read().pieces.len()
    }

    fn intern(&self, piece: &str) -> TokenId {
        if let Some(id) = self.vocab.read().ids.get(piece) {
            return *id;
        }
        let mut vocab = self.vocab.write();
        if let Some(id) = vocab.ids.get(piece) {
            return *id;
        }
        let id = vocab.pieces.len() as TokenId;
        vocab.pieces.push(piece.to_owned());
        vocab.ids.insert(piece.to_owned(), id);
        id
    }

    fn is_special(id: TokenId) -> bool {
        RESERVED.iter().any(|(_, rid, special)| *rid == id && *special)
    }
}

/// Position and length of the earliest reserved piece in `text`
fn next_reserved(text: &str) -> Option<(usize, &'static str, TokenId)> {
    RESERVED
        .iter()
        .filter_map(|(piece, id, _)| text.find(piece).map(|pos| (pos, *piece, *id)))
        .min_by_key(|(pos, _, _)| *pos)
}

/// Split into pieces of leading whitespace followed by a non-whitespace run
fn word_pieces(text: &str) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut start = 0;
    let mut seen_word = false;
    for (idx, ch) in text.char_indices() {
        if ch.is_whitespace() {
            if seen_word {
                pieces.push(&text[start..idx]);
                start = idx;
                seen_word = false;
            }
        } else {
            seen_word = true;
        }
    }
    if start < text.len() {
        pieces.push(&text[start..]);
    }
    pieces
}

impl Tokenizer for ScriptedTokenizer {
    fn encode(&self, text: &str, add_special_tokens: bool) -> Result<Vec<TokenId>> {
        let mut ids = Vec::new();
        if add_special_tokens {
            ids.push(BOS_ID);
        }

        let mut rest = text;
        while !rest.is_empty() {
            let (plain, reserved) = match next_reserved(rest) {
                Some((pos, piece, id)) => (&rest[..pos], Some((piece, id))),
                None => (rest, None),
            };
            for piece in word_pieces(plain) {
                ids.push(self.intern(piece));
            }
            match reserved {
                Some((piece, id)) => {
                    ids.push(id);
                    rest = &rest[plain.len() + piece.len()..];
                }
                None => break,
            }
        }

        Ok(ids)
    }

    fn decode(&self, ids: &[TokenId], skip_special_tokens: bool) -> Result<String> {
        let vocab = self.vocab.read();
        let mut text = String::new();
        for &id in ids {
            if skip_special_tokens && Self::is_special(id) {
                continue;
            }
            let piece = vocab
                .pieces
                .get(id as usize)
                .ok_or_else(|| anyhow!("unknown token id {}", id))?;
            text.push_str(piece);
        }
        Ok(text)
    }

    fn token_id(&self, piece: &str) -> Option<TokenId> {
        self.vocab.read().ids.get(piece).copied()
    }

    fn apply_chat_template(
        &self,
        messages: &[ChatMessage],
        add_generation_prompt: bool,
    ) -> Result<Vec<TokenId>> {
        let prompt = self.template.apply(messages, Some(add_generation_prompt))?;
        trace!(%prompt, "rendered chat template");
        // The template already emits the BOS delimiter
        self.encode(&prompt, false)
    }
}

/// Replays `reply` for every prompt
pub struct ScriptedModel {
    reply: Vec<TokenId>,
    alternates: Vec<Vec<TokenId>>,
    token_delay: Duration,
    fail_after_tokens: Option<usize>,
}

impl ScriptedModel {
    pub fn new(tokenizer: &ScriptedTokenizer, config: &ScriptedConfig) -> Result<Self> {
        let reply = tokenizer.encode(&config.reply, false)?;
        let alternates = config
            .alternates
            .iter()
            .map(|alt| tokenizer.encode(alt, false))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            reply,
            alternates,
            token_delay: Duration::from_millis(config.token_delay_ms),
            fail_after_tokens: config.fail_after_tokens,
        })
    }
}

impl Model for ScriptedModel {
    fn generate(
        &self,
        input_ids: &[TokenId],
        options: &GenerateOptions,
        streamer: &mut dyn TokenStreamer,
    ) -> Result<Vec<Vec<TokenId>>> {
        let mut sequence = input_ids.to_vec();
        let mut produced = 0usize;
        let mut finished = true;

        for &id in self.reply.iter().take(options.max_new_tokens) {
            if options.should_stop() {
                debug!(produced, "stopping criteria met");
                finished = false;
                break;
            }
            if self.fail_after_tokens == Some(produced) {
                streamer.end();
                bail!("scripted failure after {} tokens", produced);
            }
            if streamer.put(&[id]) == StreamControl::Stop {
                debug!(produced, "streamer requested stop");
                finished = false;
                break;
            }
            sequence.push(id);
            produced += 1;

            if !self.token_delay.is_zero() {
                std::thread::sleep(self.token_delay);
            }
        }

        if finished && produced == self.reply.len() {
            sequence.push(EOS_ID);
        }
        streamer.end();

        let mut sequences = vec![sequence];
        for alternate in &self.alternates {
            let mut seq = input_ids.to_vec();
            seq.extend(alternate.iter().take(options.max_new_tokens));
            sequences.push(seq);
        }
        Ok(sequences)
    }
}

/// Placeholder in scripted file names replaced by `backend.dtype`
const DTYPE_PLACEHOLDER: &str = "{dtype}";

/// Loader for the scripted backend, simulating artifact downloads
pub struct ScriptedLoader {
    config: ScriptedConfig,
    backend: BackendConfig,
    tokenizer: Arc<ScriptedTokenizer>,
    failures_left: AtomicU32,
}

impl ScriptedLoader {
    pub fn new(config: ScriptedConfig) -> Self {
        let failures_left = AtomicU32::new(config.fail_loads);
        Self {
            config,
            backend: BackendConfig::default(),
            tokenizer: Arc::new(ScriptedTokenizer::new()),
            failures_left,
        }
    }

    /// Model id, dtype and device the simulated artifacts stand in for
    pub fn with_backend(mut self, backend: BackendConfig) -> Self {
        self.backend = backend;
        self
    }

    /// Artifact name as reported in progress events
    fn file_name(&self, file: &ScriptedFile) -> String {
        file.name.replace(DTYPE_PLACEHOLDER, &self.backend.dtype)
    }

    fn tokenizer_files(&self) -> impl Iterator<Item = &ScriptedFile> {
        self.config.files.iter().filter(|f| is_tokenizer_file(&f.name))
    }

    fn model_files(&self) -> impl Iterator<Item = &ScriptedFile> {
        self.config.files.iter().filter(|f| !is_tokenizer_file(&f.name))
    }

    async fn simulate_download(&self, file: &ScriptedFile, progress: &ProgressSink) {
        const STEPS: u64 = 4;
        let step_delay = Duration::from_millis(self.config.load_delay_ms / STEPS);
        let name = self.file_name(file);

        progress(LoadEvent::Initiate { file: name.clone() });
        for step in 0..=STEPS {
            progress(LoadEvent::Download {
                file: name.clone(),
                progress: (step * 100 / STEPS) as f64,
                total: Some(file.size),
            });
            if step < STEPS && !step_delay.is_zero() {
                tokio::time::sleep(step_delay).await;
            }
        }
        progress(LoadEvent::Done { file: name });
    }
}

fn is_tokenizer_file(name: &str) -> bool {
    name.starts_with("tokenizer")
}

#[async_trait]
impl BackendLoader for ScriptedLoader {
    async fn load_tokenizer(&self, progress: ProgressSink) -> Result<Arc<dyn Tokenizer>> {
        for file in self.tokenizer_files() {
            self.simulate_download(file, &progress).await;
        }
        let tokenizer: Arc<dyn Tokenizer> = self.tokenizer.clone();
        Ok(tokenizer)
    }

    async fn load_model(&self, progress: ProgressSink) -> Result<Arc<dyn Model>> {
        for file in self.model_files() {
            self.simulate_download(file, &progress).await;
        }

        let failed = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            bail!("simulated artifact fetch failure");
        }

        let model = ScriptedModel::new(&self.tokenizer, &self.config)?;
        info!(
            model_id = %self.backend.model_id,
            device = %self.backend.device,
            reply_tokens = model.reply.len(),
            "scripted model ready"
        );
        Ok(Arc::new(model))
    }

    fn describe(&self) -> String {
        format!(
            "scripted {} ({} on {}, {} files)",
            self.backend.model_id,
            self.backend.dtype,
            self.backend.device,
            self.config.files.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::InterruptToken;
    use crate::runtime::NullStreamer;

    struct Collect(Vec<TokenId>);

    impl TokenStreamer for Collect {
        fn put(&mut self, tokens: &[TokenId]) -> StreamControl {
            self.0.extend_from_slice(tokens);
            StreamControl::Continue
        }
    }

    fn fast_config(reply: &str) -> ScriptedConfig {
        ScriptedConfig {
            reply: reply.to_owned(),
            token_delay_ms: 0,
            load_delay_ms: 0,
            ..Default::default()
        }
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let tokenizer = ScriptedTokenizer::new();
        let text = "<think>\nLet me see.\n</think>\n\nThe answer is  42.";
        let ids = tokenizer.encode(text, false).unwrap();
        assert_eq!(ids[0], THINK_OPEN_ID);
        assert!(ids.contains(&THINK_CLOSE_ID));
        assert_eq!(tokenizer.decode(&ids, false).unwrap(), text);
    }

    #[test]
    fn test_sentinel_is_second_probe_token() {
        let tokenizer = ScriptedTokenizer::new();
        let ids = tokenizer.encode(thinking::SENTINEL_PROBE, false).unwrap();
        assert_eq!(ids, vec![THINK_OPEN_ID, THINK_CLOSE_ID]);
        assert_eq!(tokenizer.token_id(thinking::CLOSE), Some(THINK_CLOSE_ID));
    }

    #[test]
    fn test_special_tokens_skipped_on_request() {
        let tokenizer = ScriptedTokenizer::new();
        let ids = tokenizer.encode("hi", true).unwrap();
        assert_eq!(ids[0], BOS_ID);
        assert_eq!(tokenizer.decode(&ids, true).unwrap(), "hi");
        assert_eq!(
            tokenizer.decode(&[BOS_ID, EOS_ID], false).unwrap(),
            format!("{}{}", delimiters::BOS, delimiters::EOS)
        );
        assert!(tokenizer.decode(&[9_999], false).is_err());
    }

    #[test]
    fn test_chat_template_tokens() {
        let tokenizer = ScriptedTokenizer::new();
        let ids = tokenizer
            .apply_chat_template(&[ChatMessage::user("Solve x^2-3x+2=0")], true)
            .unwrap();
        assert_eq!(ids.first(), Some(&BOS_ID));
        assert_eq!(ids[1], USER_ID);
        assert_eq!(ids.last(), Some(&ASSISTANT_ID));
    }

    #[test]
    fn test_model_replays_reply_and_appends_eos() {
        let tokenizer = ScriptedTokenizer::new();
        let model = ScriptedModel::new(&tokenizer, &fast_config("one two three")).unwrap();
        let mut streamer = Collect(Vec::new());
        let options = GenerateOptions {
            max_new_tokens: 100,
            stopping: None,
        };

        let out = model.generate(&[BOS_ID], &options, &mut streamer).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].first(), Some(&BOS_ID));
        assert_eq!(out[0].last(), Some(&EOS_ID));
        assert_eq!(streamer.0.len(), 3);
        assert_eq!(tokenizer.decode(&streamer.0, true).unwrap(), "one two three");
    }

    #[test]
    fn test_model_honours_max_tokens_and_interrupt() {
        let tokenizer = ScriptedTokenizer::new();
        let model = ScriptedModel::new(&tokenizer, &fast_config("a b c d e")).unwrap();

        let options = GenerateOptions {
            max_new_tokens: 2,
            stopping: None,
        };
        let out = model.generate(&[], &options, &mut NullStreamer).unwrap();
        assert_eq!(out[0].len(), 2);

        let token = InterruptToken::new();
        token.interrupt();
        let options = GenerateOptions {
            max_new_tokens: 100,
            stopping: Some(token),
        };
        let out = model.generate(&[], &options, &mut NullStreamer).unwrap();
        assert!(out[0].is_empty());
    }

    #[test]
    fn test_model_failure_injection() {
        let tokenizer = ScriptedTokenizer::new();
        let config = ScriptedConfig {
            fail_after_tokens: Some(1),
            ..fast_config("a b c")
        };
        let model = ScriptedModel::new(&tokenizer, &config).unwrap();
        let options = GenerateOptions {
            max_new_tokens: 10,
            stopping: None,
        };
        assert!(model.generate(&[], &options, &mut NullStreamer).is_err());
    }

    #[tokio::test]
    async fn test_loader_reports_progress_and_fails_once() {
        let config = ScriptedConfig {
            fail_loads: 1,
            ..fast_config("ok")
        };
        let loader = ScriptedLoader::new(config);
        let events = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink: ProgressSink = {
            let events = events.clone();
            Arc::new(move |e: LoadEvent| events.lock().push(e))
        };

        assert!(loader.load_model(sink.clone()).await.is_err());
        assert!(loader.load_model(sink.clone()).await.is_ok());
        loader.load_tokenizer(sink).await.unwrap();

        let events = events.lock();
        assert!(events
            .iter()
            .any(|e| matches!(e, LoadEvent::Download { file, progress, .. } if file == "tokenizer.json" && *progress == 100.0)));
        assert!(events.iter().any(|e| matches!(e, LoadEvent::Done { file } if file == "onnx/model_q4f16.onnx")));
    }

    #[tokio::test]
    async fn test_loader_follows_backend_config() {
        let backend = BackendConfig {
            model_id: "org/tiny-r1".to_owned(),
            dtype: "fp16".to_owned(),
            device: "cpu".to_owned(),
            ..Default::default()
        };
        let loader = ScriptedLoader::new(fast_config("ok")).with_backend(backend);
        assert_eq!(loader.describe(), "scripted org/tiny-r1 (fp16 on cpu, 4 files)");

        let files = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink: ProgressSink = {
            let files = files.clone();
            Arc::new(move |e: LoadEvent| {
                if let LoadEvent::Done { file } = e {
                    files.lock().push(file);
                }
            })
        };
        loader.load_model(sink).await.unwrap();

        assert_eq!(*files.lock(), vec!["config.json", "onnx/model_fp16.onnx"]);
    }
}
