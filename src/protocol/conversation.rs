//! Validation of the `generate` payload.
//!
//! A conversation is accepted only if it is a non-empty array of
//! `{role, content}` objects whose contents carry no template delimiters and
//! no unbalanced thinking markers. Anything else is rejected before the
//! backend is touched.

use serde_json::Value;

use crate::constants::{delimiters, thinking};
use crate::error::{ChatError, Result};

use super::ChatMessage;

/// Parse and validate the raw `data` field of a `generate` command.
pub fn parse_conversation(data: Value) -> Result<Vec<ChatMessage>> {
    let items = match data {
        Value::Array(items) => items,
        other => {
            return Err(ChatError::input(format!(
                "Invalid message data for generate command (expected an array, got {})",
                json_type_name(&other)
            )))
        }
    };

    let mut messages = Vec::with_capacity(items.len());
    for (index, item) in items.into_iter().enumerate() {
        let message: ChatMessage = serde_json::from_value(item)
            .map_err(|e| ChatError::input(format!("message {index}: {e}")))?;
        messages.push(message);
    }

    validate_conversation(&messages)?;
    Ok(messages)
}

/// Check the content invariants of an already-typed conversation.
pub fn validate_conversation(messages: &[ChatMessage]) -> Result<()> {
    if messages.is_empty() {
        return Err(ChatError::input("conversation is empty"));
    }

    for (index, message) in messages.iter().enumerate() {
        if let Some(delimiter) = find_role_delimiter(&message.content) {
            return Err(ChatError::input(format!(
                "message {index} ({}) contains reserved delimiter {delimiter}",
                message.role.as_str()
            )));
        }
        if !thinking_markers_balanced(&message.content) {
            return Err(ChatError::input(format!(
                "message {index} ({}) contains unbalanced thinking markers",
                message.role.as_str()
            )));
        }
    }

    Ok(())
}

/// First reserved role delimiter found in `text`, if any.
pub fn find_role_delimiter(text: &str) -> Option<&'static str> {
    delimiters::ROLE_DELIMITERS
        .iter()
        .copied()
        .find(|d| text.contains(d))
}

pub fn has_role_delimiter(text: &str) -> bool {
    find_role_delimiter(text).is_some()
}

/// True when every open marker is closed, in order, and nothing is closed
/// without having been opened.
pub fn thinking_markers_balanced(text: &str) -> bool {
    let mut depth = 0usize;
    let mut rest = text;
    loop {
        let open = rest.find(thinking::OPEN);
        let close = rest.find(thinking::CLOSE);
        match (open, close) {
            (None, None) => return depth == 0,
            (Some(o), Some(c)) if o < c => {
                depth += 1;
                rest = &rest[o + thinking::OPEN.len()..];
            }
            (Some(o), None) => {
                depth += 1;
                rest = &rest[o + thinking::OPEN.len()..];
            }
            (_, Some(c)) => {
                if depth == 0 {
                    return false;
                }
                depth -= 1;
                rest = &rest[c + thinking::CLOSE.len()..];
            }
        }
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
