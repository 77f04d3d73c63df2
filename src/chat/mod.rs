//! Consumer side of the status protocol: response post-processing and the
//! conversation state a front end renders from.

pub mod response;
pub mod session;

pub use response::{
    clean_message_history, extract_answer, extract_thinking, process_message,
    validate_message_output, ProcessedMessage,
};
pub use session::{ChatSession, FileProgress, SessionEvent, SessionMessage, WorkerStatus};
