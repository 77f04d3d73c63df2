//! Error taxonomy shared by the orchestrator and its consumers.
//!
//! Every failure is caught at its command boundary and converted into a single
//! `error` status event; nothing crosses the channel as a panic or a raw
//! backend error.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T, E = ChatError> = std::result::Result<T, E>;

/// Orchestrator error type.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ChatError {
    /// Required acceleration is absent in the hosting environment.
    #[error("GPU acceleration is not supported ({0})")]
    Capability(String),

    /// Backend artifacts could not be fetched or compiled.
    #[error("Backend resolution failed: {0}")]
    Resolution(String),

    /// The conversation payload was malformed.
    #[error("Invalid input: {0}")]
    Input(String),

    /// The backend failed mid-stream or returned an unusable result.
    #[error("Generation failed: {0}")]
    Generation(String),

    /// Generated text leaked template delimiters or unbalanced thinking markers.
    #[error("Invalid message format detected: {0}")]
    Format(String),

    /// A wire message could not be decoded.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The orchestrator channel is closed.
    #[error("Orchestrator communication failed: {0}")]
    Channel(String),
}

/// Wire-level classification of a [`ChatError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    Capability,
    Resolution,
    Input,
    Generation,
    Format,
    Protocol,
    Channel,
}

impl ChatError {
    pub fn capability<S: Into<String>>(msg: S) -> Self {
        Self::Capability(msg.into())
    }

    pub fn resolution<S: Into<String>>(msg: S) -> Self {
        Self::Resolution(msg.into())
    }

    pub fn input<S: Into<String>>(msg: S) -> Self {
        Self::Input(msg.into())
    }

    pub fn generation<S: Into<String>>(msg: S) -> Self {
        Self::Generation(msg.into())
    }

    pub fn format<S: Into<String>>(msg: S) -> Self {
        Self::Format(msg.into())
    }

    pub fn protocol<S: Into<String>>(msg: S) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn channel<S: Into<String>>(msg: S) -> Self {
        Self::Channel(msg.into())
    }

    /// Wire classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Capability(_) => ErrorKind::Capability,
            Self::Resolution(_) => ErrorKind::Resolution,
            Self::Input(_) => ErrorKind::Input,
            Self::Generation(_) => ErrorKind::Generation,
            Self::Format(_) => ErrorKind::Format,
            Self::Protocol(_) => ErrorKind::Protocol,
            Self::Channel(_) => ErrorKind::Channel,
        }
    }

    /// Whether re-issuing the same command can succeed without changing the
    /// environment or the input.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Resolution(_) | Self::Channel(_))
    }

    /// Rebuild a typed error from an `error` event received over the wire.
    pub fn from_wire(kind: Option<ErrorKind>, message: impl Into<String>) -> Self {
        let message = message.into();
        match kind.unwrap_or(ErrorKind::Generation) {
            ErrorKind::Capability => Self::Capability(message),
            ErrorKind::Resolution => Self::Resolution(message),
            ErrorKind::Input => Self::Input(message),
            ErrorKind::Generation => Self::Generation(message),
            ErrorKind::Format => Self::Format(message),
            ErrorKind::Protocol => Self::Protocol(message),
            ErrorKind::Channel => Self::Channel(message),
        }
    }
}
