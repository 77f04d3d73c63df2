//! GPU acceleration probe used by `check` and `load`.

use std::path::PathBuf;
use tracing::debug;

use crate::error::ChatError;

/// Environment variables whose presence signals a usable accelerator
pub const DEFAULT_ENV_SIGNALS: [&str; 3] = ["CUDA_VISIBLE_DEVICES", "HIP_VISIBLE_DEVICES", "WGPU_ADAPTER_NAME"];

/// Filesystem paths whose presence signals a usable accelerator
pub const DEFAULT_PATH_SIGNALS: [&str; 4] = ["/dev/dri", "/dev/nvidia0", "/usr/local/cuda", "/opt/rocm"];

/// Description of the accelerator that satisfied the probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterInfo {
    pub name: String,
}

pub trait AccelerationProbe: Send + Sync {
    fn probe(&self) -> Result<AdapterInfo, ChatError>;
}

/// Probe backed by environment variables and well-known device paths
#[derive(Debug, Clone)]
pub struct EnvironmentProbe {
    env_vars: Vec<String>,
    paths: Vec<PathBuf>,
}

impl Default for EnvironmentProbe {
    fn default() -> Self {
        Self {
            env_vars: DEFAULT_ENV_SIGNALS.iter().map(|s| (*s).to_owned()).collect(),
            paths: DEFAULT_PATH_SIGNALS.iter().map(PathBuf::from).collect(),
        }
    }
}

impl EnvironmentProbe {
    /// Default signals plus `extra_paths`
    pub fn with_extra_paths<I, P>(extra_paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        let mut probe = Self::default();
        probe.paths.extend(extra_paths.into_iter().map(Into::into));
        probe
    }

    /// Probe only the given signals
    pub fn custom(env_vars: Vec<String>, paths: Vec<PathBuf>) -> Self {
        Self { env_vars, paths }
    }
}

impl AccelerationProbe for EnvironmentProbe {
    fn probe(&self) -> Result<AdapterInfo, ChatError> {
        for var in &self.env_vars {
            if let Ok(value) = std::env::var(var) {
                debug!(%var, %value, "accelerator signalled by environment");
                return Ok(AdapterInfo {
                    name: format!("{var}={value}"),
                });
            }
        }

        for path in &self.paths {
            if path.exists() {
                debug!(path = %path.display(), "accelerator signalled by device path");
                return Ok(AdapterInfo {
                    name: path.display().to_string(),
                });
            }
        }

        Err(ChatError::capability("no adapter found"))
    }
}

/// Probe with a fixed answer, for hosts where detection is known up front
#[derive(Debug, Clone)]
pub struct StaticProbe {
    adapter: Option<String>,
}

impl StaticProbe {
    pub fn available(name: impl Into<String>) -> Self {
        Self {
            adapter: Some(name.into()),
        }
    }

    pub fn unavailable() -> Self {
        Self { adapter: None }
    }
}

impl AccelerationProbe for StaticProbe {
    fn probe(&self) -> Result<AdapterInfo, ChatError> {
        self.adapter
            .as_ref()
            .map(|name| AdapterInfo { name: name.clone() })
            .ok_or_else(|| ChatError::capability("no adapter found"))
    }
}
