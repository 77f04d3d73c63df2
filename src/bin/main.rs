//! thinkstream binary.
//!
//! Entry point for the orchestrator: the JSON-lines service, the terminal chat
//! client and the acceleration check.

use anyhow::Context;
use clap::Parser;
use std::path::{Path, PathBuf};
use thinkstream_core::{
    cli::commands::Commands,
    cli::handlers::{handle_chat, handle_check, handle_serve},
    config::{LoggingConfig, ThinkstreamConfig},
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file (TOML or JSON) used instead of the XDG lookup
    #[arg(long, global = true, env = "THINKSTREAM_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log filter directive, takes precedence over RUST_LOG
    #[arg(long, global = true)]
    pub log_filter: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

fn load_config(path: Option<&Path>) -> anyhow::Result<ThinkstreamConfig> {
    let config = match path {
        Some(path) => ThinkstreamConfig::from_file(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?,
        None => ThinkstreamConfig::load().context("failed to load configuration")?,
    };
    config.validate()?;
    Ok(config)
}

/// Logs always go to stderr; stdout carries the protocol.
fn init_logging(logging: &LoggingConfig, filter_override: Option<&str>) {
    let filter = match filter_override {
        Some(directive) => EnvFilter::new(directive),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.filter)),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_names(true);

    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = load_config(cli.config.as_deref())?;
    init_logging(&config.logging, cli.log_filter.as_deref());

    info!(version = env!("CARGO_PKG_VERSION"), "thinkstream starting up");

    match cli.command {
        Commands::Serve(cmd) => handle_serve(config, cmd).await,
        Commands::Chat(cmd) => handle_chat(config, cmd).await,
        Commands::Check(cmd) => handle_check(config, cmd).await,
    }
}
