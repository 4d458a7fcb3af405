//! CLI command definitions

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// DeskConnector - bridges a desktop peer to a streaming agent engine
#[derive(Debug, Parser)]
#[command(
    name = "dc",
    about = "Session orchestrator between a desktop peer and an agent engine",
    version = env!("GIT_DESCRIBE"),
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(
        short = 'l',
        long = "log-level",
        global = true,
        help = "Log level (TRACE, DEBUG, INFO, WARN, ERROR)"
    )]
    pub log_level: Option<String>,

    /// Peer address (overrides config and CONNECTOR_SERVER_URL)
    #[arg(short, long, global = true)]
    pub server: Option<String>,

    /// Repository to work in (defaults to the current directory)
    #[arg(short, long = "base-dir", global = true)]
    pub base_dir: Option<PathBuf>,

    /// Accepted for compatibility; file watching is not supported
    #[arg(long = "watch-files", global = true)]
    pub watch_files: bool,

    /// Initial reasoning effort for the main model
    #[arg(long = "reasoning-effort", global = true)]
    pub reasoning_effort: Option<String>,

    /// Initial thinking-token budget for the main model (e.g. 8k)
    #[arg(long = "thinking-tokens", global = true)]
    pub thinking_tokens: Option<String>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum Command {
    /// Connect to the peer and serve the session (default)
    Connect,

    /// Print the effective configuration as YAML
    Config,

    /// List the model catalog
    Models,
}
