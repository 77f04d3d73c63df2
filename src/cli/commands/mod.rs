pub mod chat;
pub mod check;
pub mod serve;

pub use chat::ChatCommand;
pub use check::CheckCommand;
pub use serve::ServeCommand;

use clap::Subcommand;

#[derive(Subcommand)]
pub enum Commands {
    /// Run the orchestrator over JSON lines on stdin/stdout
    Serve(ServeCommand),
    /// Chat with the model in the terminal
    Chat(ChatCommand),
    /// Probe for GPU acceleration and exit
    Check(CheckCommand),
}
