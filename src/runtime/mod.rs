//! Runtime abstraction layer for inference backends
//!
//! The orchestrator never touches weights, tokenization algorithms or tensor
//! math. It drives a backend through the traits below:
//! - `Tokenizer`: text ↔ token ids, chat template application
//! - `Model`: blocking, streamer-driven generation
//! - `BackendLoader`: asynchronous resolution of both, with progress events

use anyhow::Result;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

use crate::inference::InterruptToken;
use crate::protocol::ChatMessage;

pub mod capability; // GPU acceleration probe
pub mod scripted; // Deterministic reference backend
pub mod template_engine; // Jinja2 template engine for chat templates
pub mod utf8_decoder; // Incremental UTF-8 decoding across token boundaries

pub use capability::{AccelerationProbe, AdapterInfo, EnvironmentProbe, StaticProbe};
pub use scripted::{ScriptedLoader, ScriptedModel, ScriptedTokenizer};
pub use template_engine::{ChatTemplate, TemplateConfig};
pub use utf8_decoder::IncrementalUtf8Decoder;

/// Token id as produced by the tokenizer
pub type TokenId = u32;

/// Tokenizer half of a backend
pub trait Tokenizer: Send + Sync {
    fn encode(&self, text: &str, add_special_tokens: bool) -> Result<Vec<TokenId>>;

    fn decode(&self, ids: &[TokenId], skip_special_tokens: bool) -> Result<String>;

    fn batch_decode(&self, sequences: &[Vec<TokenId>], skip_special_tokens: bool) -> Result<Vec<String>> {
        sequences
            .iter()
            .map(|ids| self.decode(ids, skip_special_tokens))
            .collect()
    }

    /// Id of a single vocabulary piece, if it is one token
    fn token_id(&self, piece: &str) -> Option<TokenId>;

    /// Render the conversation through the model's template and tokenize it
    fn apply_chat_template(
        &self,
        messages: &[ChatMessage],
        add_generation_prompt: bool,
    ) -> Result<Vec<TokenId>>;
}

/// Control flow for streamer callbacks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamControl {
    Continue,
    Stop,
}

/// Receives token batches as the model produces them
pub trait TokenStreamer: Send {
    /// Called once per generation step with the newly produced ids
    fn put(&mut self, tokens: &[TokenId]) -> StreamControl;

    /// Called once when generation ends, however it ends
    fn end(&mut self) {}
}

/// Streamer that discards everything (warm-up runs)
#[derive(Debug, Default)]
pub struct NullStreamer;

impl TokenStreamer for NullStreamer {
    fn put(&mut self, _tokens: &[TokenId]) -> StreamControl {
        StreamControl::Continue
    }
}

/// Per-call generation parameters
#[derive(Debug, Clone, Default)]
pub struct GenerateOptions {
    pub max_new_tokens: usize,
    /// Polled at each token boundary; a tripped token ends the run normally
    pub stopping: Option<InterruptToken>,
}

impl GenerateOptions {
    pub fn should_stop(&self) -> bool {
        self.stopping
            .as_ref()
            .map(InterruptToken::is_interrupted)
            .unwrap_or(false)
    }
}

/// Model half of a backend
pub trait Model: Send + Sync {
    /// Run generation to completion, interruption or `max_new_tokens`.
    ///
    /// Returns one full sequence (prompt followed by generated ids) per
    /// candidate. Blocking; callers run it off the async executor.
    fn generate(
        &self,
        input_ids: &[TokenId],
        options: &GenerateOptions,
        streamer: &mut dyn TokenStreamer,
    ) -> Result<Vec<Vec<TokenId>>>;
}

/// Artifact acquisition event reported while a backend resolves
#[derive(Debug, Clone, PartialEq)]
pub enum LoadEvent {
    Initiate { file: String },
    Download { file: String, progress: f64, total: Option<u64> },
    Done { file: String },
    /// Any other environment-specific sub-status
    Other { status: String, file: String },
}

impl LoadEvent {
    pub fn file(&self) -> &str {
        match self {
            Self::Initiate { file }
            | Self::Download { file, .. }
            | Self::Done { file }
            | Self::Other { file, .. } => file,
        }
    }
}

/// Callback receiving load events; invoked from loader tasks
pub type ProgressSink = Arc<dyn Fn(LoadEvent) + Send + Sync>;

/// Resolves tokenizer and model artifacts
#[async_trait]
pub trait BackendLoader: Send + Sync {
    async fn load_tokenizer(&self, progress: ProgressSink) -> Result<Arc<dyn Tokenizer>>;

    async fn load_model(&self, progress: ProgressSink) -> Result<Arc<dyn Model>>;

    /// Short human-readable description for logs
    fn describe(&self) -> String;
}

/// A resolved tokenizer/model pair
#[derive(Clone)]
pub struct Backend {
    pub tokenizer: Arc<dyn Tokenizer>,
    pub model: Arc<dyn Model>,
}

impl Backend {
    /// Whether two handles point at the same resolved pair
    pub fn same_as(&self, other: &Backend) -> bool {
        let tokenizer = Arc::as_ptr(&self.tokenizer) as *const ();
        let model = Arc::as_ptr(&self.model) as *const ();
        tokenizer == Arc::as_ptr(&other.tokenizer) as *const ()
            && model == Arc::as_ptr(&other.model) as *const ()
    }
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backend").finish_non_exhaustive()
    }
}
