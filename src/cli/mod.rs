//! Command-line interface module.
//!
//! This module provides the CLI functionality for:
//! - Serving the status protocol over stdin/stdout
//! - Interactive terminal chat
//! - Acceleration checks

pub mod commands;
pub mod handlers;

pub use handlers::{handle_chat, handle_check, handle_serve, serve_lines};
