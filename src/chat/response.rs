//! Post-processing of assistant text: answer/thinking extraction, history
//! cleaning and output validation.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::constants::{delimiters, thinking};
use crate::error::{ChatError, Result};
use crate::protocol::conversation::{find_role_delimiter, thinking_markers_balanced};
use crate::protocol::{ChatMessage, Role};

lazy_static! {
    static ref THINK_SEGMENT: Regex = Regex::new(r"(?s)<think>.*?</think>")
        .unwrap_or_else(|e| panic!("invalid thinking pattern: {e}"));
    static ref THINK_CAPTURE: Regex = Regex::new(r"(?s)<think>(.*?)</think>")
        .unwrap_or_else(|e| panic!("invalid thinking pattern: {e}"));
}

/// Thinking and answer parts of one assistant message
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessedMessage {
    pub thinking: String,
    pub answer: String,
}

/// The displayable answer: text after the last assistant delimiter with every
/// thinking segment removed.
///
/// A stray close marker keeps only what follows it; a stray open marker
/// (thinking that never finished) drops everything after it.
pub fn extract_answer(content: &str) -> String {
    let last = content
        .rsplit(delimiters::ASSISTANT)
        .next()
        .unwrap_or(content);

    let mut answer = THINK_SEGMENT.replace_all(last.trim(), "").into_owned();

    if let Some(pos) = answer.rfind(thinking::CLOSE) {
        answer = answer[pos + thinking::CLOSE.len()..].to_owned();
    }
    if let Some(pos) = answer.find(thinking::OPEN) {
        answer.truncate(pos);
    }
    for delimiter in delimiters::ROLE_DELIMITERS {
        answer = answer.replace(delimiter, "");
    }

    answer.trim().to_owned()
}

/// Content of the first thinking segment, or of an unterminated one.
pub fn extract_thinking(content: &str) -> String {
    if let Some(caps) = THINK_CAPTURE.captures(content) {
        return caps
            .get(1)
            .map(|m| m.as_str().trim().to_owned())
            .unwrap_or_default();
    }
    match content.find(thinking::OPEN) {
        Some(pos) => content[pos + thinking::OPEN.len()..].trim().to_owned(),
        None => String::new(),
    }
}

/// Strip reasoning and template delimiters from assistant turns.
///
/// Must be applied before a history is re-submitted; user turns pass through
/// unchanged.
pub fn clean_message_history(messages: &[ChatMessage]) -> Vec<ChatMessage> {
    messages
        .iter()
        .map(|msg| match msg.role {
            Role::Assistant => ChatMessage::assistant(extract_answer(&msg.content)),
            Role::User => msg.clone(),
        })
        .collect()
}

pub fn process_message(content: &str) -> ProcessedMessage {
    ProcessedMessage {
        thinking: extract_thinking(content),
        answer: extract_answer(content),
    }
}

/// Reject generated text with leaked role delimiters or unbalanced markers.
pub fn validate_message_output(output: &str) -> Result<()> {
    if let Some(delimiter) = find_role_delimiter(output) {
        return Err(ChatError::format(format!("leaked role delimiter {delimiter}")));
    }
    if !thinking_markers_balanced(output) {
        return Err(ChatError::format("unbalanced thinking markers"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_answer() {
        assert_eq!(
            extract_answer("<think>\nfactor it\n</think>\n\nx = 1 or x = 2"),
            "x = 1 or x = 2"
        );
        assert_eq!(
            extract_answer("<｜User｜>hi<｜Assistant｜>  <think>a</think>Hello!  "),
            "Hello!"
        );
        assert_eq!(extract_answer("plain"), "plain");
    }

    #[test]
    fn test_extract_answer_stray_markers() {
        assert_eq!(extract_answer("reasoning without open</think> answer"), "answer");
        assert_eq!(extract_answer("<think>never finished"), "");
        assert_eq!(extract_answer("<think>a</think>b<think>c"), "b");
    }

    #[test]
    fn test_extract_thinking() {
        assert_eq!(extract_thinking("<think>\n step one \n</think>answer"), "step one");
        assert_eq!(extract_thinking("<think>partial"), "partial");
        assert_eq!(extract_thinking("no thinking"), "");
    }

    #[test]
    fn test_clean_history_touches_only_assistant_turns() {
        let history = vec![
            ChatMessage::user("<think>user text is left alone</think>"),
            ChatMessage::assistant("<｜Assistant｜><think>hmm</think>\n\nHello<｜end▁of▁sentence｜>"),
        ];
        let cleaned = clean_message_history(&history);
        assert_eq!(cleaned[0], history[0]);
        assert_eq!(cleaned[1], ChatMessage::assistant("Hello"));
    }

    #[test]
    fn test_process_message() {
        let processed = process_message("<think>why</think>because");
        assert_eq!(
            processed,
            ProcessedMessage {
                thinking: "why".into(),
                answer: "because".into()
            }
        );
    }

    #[test]
    fn test_validate_message_output() {
        assert!(validate_message_output("<think>a</think>b").is_ok());
        assert!(validate_message_output("just text").is_ok());

        let err = validate_message_output("<think>a").unwrap_err();
        assert!(matches!(err, ChatError::Format(_)));
        assert!(err.to_string().starts_with("Invalid message format detected"));

        assert!(validate_message_output("b<｜User｜>c").is_err());
        assert!(validate_message_output("b<｜Assistant｜>c").is_err());
    }
}
