//! Layered configuration for thinkstream
//!
//! Sources, lowest priority first:
//! - compiled defaults (`ThinkstreamConfig::default()`)
//! - `$XDG_CONFIG_HOME/thinkstream/config{,.toml,.json}`
//! - `THINKSTREAM__SECTION__KEY` environment variables

use anyhow::{anyhow, bail};
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use xdg::BaseDirectories;

use crate::constants::{DEFAULT_MAX_NEW_TOKENS, DEFAULT_MODEL_ID};

/// Application name for XDG directories
const APP_NAME: &str = "thinkstream";

/// Root configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ThinkstreamConfig {
    #[serde(default)]
    pub backend: BackendConfig,

    #[serde(default)]
    pub generation: GenerationConfig,

    #[serde(default)]
    pub capability: CapabilityConfig,

    /// Knobs of the bundled scripted backend
    #[serde(default)]
    pub scripted: ScriptedConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Which backend to resolve and how
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Model repository identifier
    pub model_id: String,
    /// Weight quantization requested from the loader
    pub dtype: String,
    /// Execution device requested from the loader
    pub device: String,
    pub kind: BackendKind,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            model_id: DEFAULT_MODEL_ID.to_owned(),
            dtype: "q4f16".to_owned(),
            device: "gpu".to_owned(),
            kind: BackendKind::Scripted,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Deterministic in-process backend replaying a configured reply
    Scripted,
}

/// Generation parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Maximum tokens generated per run
    pub max_new_tokens: usize,
    /// Tokens generated by the warm-up run during `load`
    pub warmup_max_new_tokens: usize,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_new_tokens: DEFAULT_MAX_NEW_TOKENS,
            warmup_max_new_tokens: 1,
        }
    }
}

/// Acceleration requirements
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityConfig {
    /// Missing acceleration fails `check` and `load` instead of warning
    pub require_gpu: bool,
    /// Device paths probed in addition to the defaults
    #[serde(default)]
    pub extra_device_paths: Vec<PathBuf>,
}

impl Default for CapabilityConfig {
    fn default() -> Self {
        Self {
            require_gpu: true,
            extra_device_paths: Vec::new(),
        }
    }
}

/// Simulated artifact of the scripted backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptedFile {
    pub name: String,
    pub size: u64,
}

impl ScriptedFile {
    pub fn new(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            size,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptedConfig {
    /// Text replayed token by token for every prompt
    pub reply: String,
    /// Extra candidate replies returned after the streamed one
    #[serde(default)]
    pub alternates: Vec<String>,
    /// Delay between generated tokens
    pub token_delay_ms: u64,
    /// Total simulated download time per file
    pub load_delay_ms: u64,
    /// Artifacts reported through progress events; `{dtype}` in a name
    /// stands for `backend.dtype`
    pub files: Vec<ScriptedFile>,
    /// Number of initial model loads that fail
    #[serde(default)]
    pub fail_loads: u32,
    /// Fail generation after this many tokens
    #[serde(default)]
    pub fail_after_tokens: Option<usize>,
}

impl Default for ScriptedConfig {
    fn default() -> Self {
        Self {
            reply: DEFAULT_SCRIPTED_REPLY.to_owned(),
            alternates: Vec::new(),
            token_delay_ms: 15,
            load_delay_ms: 200,
            files: vec![
                ScriptedFile::new("tokenizer.json", 7_031_673),
                ScriptedFile::new("tokenizer_config.json", 6_770),
                ScriptedFile::new("config.json", 1_033),
                ScriptedFile::new("onnx/model_{dtype}.onnx", 1_282_000_000),
            ],
            fail_loads: 0,
            fail_after_tokens: None,
        }
    }
}

pub const DEFAULT_SCRIPTED_REPLY: &str = "<think>\nFactor the quadratic: x^2 - 3x + 2 = (x - 1)(x - 2).\nSo the roots are where each factor is zero.\n</think>\n\nThe solutions are **x = 1** and **x = 2**.";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset
    pub filter: String,
    /// Emit JSON log lines
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "thinkstream=info,thinkstream_core=info".to_owned(),
            json: false,
        }
    }
}

impl ThinkstreamConfig {
    /// Load from defaults, the XDG config directory and the environment
    pub fn load() -> Result<Self, ConfigError> {
        let base_dirs = BaseDirectories::with_prefix(APP_NAME)
            .map_err(|e| ConfigError::Message(format!("Failed to create XDG base directories: {}", e)))?;
        let config_dir = base_dirs.get_config_home();

        Self::load_from_dir(&config_dir)
    }

    /// Same layering as [`load`](Self::load) with an explicit config directory
    pub fn load_from_dir(config_dir: &Path) -> Result<Self, ConfigError> {
        let settings = Config::builder()
            .add_source(Config::try_from(&ThinkstreamConfig::default())?)
            .add_source(File::from(config_dir.join("config")).required(false))
            .add_source(File::from(config_dir.join("config.toml")).required(false))
            .add_source(File::from(config_dir.join("config.json")).required(false))
            .add_source(Environment::with_prefix("THINKSTREAM").separator("__"));

        settings.build()?.try_deserialize()
    }

    /// Load configuration from an explicit file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let extension = path.extension().and_then(|s| s.to_str()).unwrap_or("toml");

        let config = match extension {
            "json" => serde_json::from_str(&contents)?,
            _ => toml::from_str(&contents)?,
        };

        Ok(config)
    }

    pub fn to_file(&self, path: &Path) -> anyhow::Result<()> {
        let extension = path.extension().and_then(|s| s.to_str()).unwrap_or("toml");

        let contents = match extension {
            "json" => serde_json::to_string_pretty(self)?,
            _ => toml::to_string_pretty(self)?,
        };

        std::fs::write(path, contents)?;
        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.backend.model_id.trim().is_empty() {
            bail!("backend.model_id must not be empty");
        }
        if self.generation.max_new_tokens == 0 {
            bail!("generation.max_new_tokens must be greater than zero");
        }
        if self.generation.warmup_max_new_tokens == 0 {
            bail!("generation.warmup_max_new_tokens must be greater than zero");
        }
        if self.backend.kind == BackendKind::Scripted && self.scripted.reply.is_empty() {
            return Err(anyhow!("scripted.reply must not be empty"));
        }
        Ok(())
    }
}
