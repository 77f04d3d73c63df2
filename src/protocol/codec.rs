//! JSON-lines framing: one command or status event per line.

use serde::{de::DeserializeOwned, Serialize};

use crate::error::{ChatError, Result};

use super::{Command, StatusMessage};

/// Serialize `value` as a single line, without the trailing newline.
pub fn encode_line<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| ChatError::protocol(e.to_string()))
}

/// Parse one line into `T`. Surrounding whitespace is ignored.
pub fn decode_line<T: DeserializeOwned>(line: &str) -> Result<T> {
    let line = line.trim();
    if line.is_empty() {
        return Err(ChatError::protocol("empty line"));
    }
    serde_json::from_str(line).map_err(|e| ChatError::protocol(e.to_string()))
}

pub fn decode_command(line: &str) -> Result<Command> {
    decode_line(line).map_err(|e| match e {
        ChatError::Protocol(msg) if msg.starts_with("unknown variant") => {
            ChatError::protocol(format!("Unknown message type: {msg}"))
        }
        other => other,
    })
}

pub fn decode_status(line: &str) -> Result<StatusMessage> {
    decode_line(line)
}
