//! DeskConnector - desktop peer session orchestrator
//!
//! CLI entry point: connects to the peer and serves one session.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use eyre::{Context, Result};
use tokio::runtime::Handle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use deskconnector::cli::{Cli, Command};
use deskconnector::config::Config;
use deskconnector::engine::{LlmEngineFactory, ModelCatalog, Workspace, find_repo_root};
use deskconnector::events::{EventSink, TranscriptLogger};
use deskconnector::gateway::{Endpoint, ServeOptions, connect_with_retry, serve};
use deskconnector::session::Orchestrator;

fn setup_logging(cli_log_level: Option<&str>, config_log_level: Option<&str>) -> Result<()> {
    let log_dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("deskconnector")
        .join("logs");

    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    // Priority: CLI --log-level > config file > INFO
    let level = match cli_log_level.or(config_log_level) {
        Some(s) => match s.to_uppercase().as_str() {
            "TRACE" => tracing::Level::TRACE,
            "DEBUG" => tracing::Level::DEBUG,
            "INFO" => tracing::Level::INFO,
            "WARN" | "WARNING" => tracing::Level::WARN,
            "ERROR" => tracing::Level::ERROR,
            _ => {
                eprintln!("Warning: Unknown log-level '{}', defaulting to INFO", s);
                tracing::Level::INFO
            }
        },
        None => tracing::Level::INFO,
    };

    let log_file = fs::File::create(log_dir.join("deskconnector.log")).context("Failed to create log file")?;

    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!("Logging initialized (level: {:?})", level);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let base_dir = match &cli.base_dir {
        Some(dir) => dir.clone(),
        None => std::env::current_dir().context("Failed to read current directory")?,
    };

    let config_log_level = Config::load_log_level(cli.config.as_ref(), &base_dir);
    setup_logging(cli.log_level.as_deref(), config_log_level.as_deref()).context("Failed to setup logging")?;

    let config = Config::load(cli.config.as_ref(), &base_dir).context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    debug!(command = ?cli.command, "main: dispatching command");
    match cli.command.clone().unwrap_or(Command::Connect) {
        Command::Connect => {
            debug!("main: matched Connect command");
            cmd_connect(&cli, &config, &base_dir).await
        }
        Command::Config => {
            debug!("main: matched Config command");
            cmd_config(&config)
        }
        Command::Models => {
            debug!("main: matched Models command");
            cmd_models(&config)
        }
    }
}

async fn cmd_connect(cli: &Cli, config: &Config, base_dir: &Path) -> Result<()> {
    if cli.watch_files {
        warn!("--watch-files is not supported, ignoring");
        eprintln!("Warning: --watch-files is not supported, ignoring");
    }

    let root = find_repo_root(base_dir).context("DeskConnector must run inside a git repository")?;
    info!(root = %root.display(), "cmd_connect: repository found");

    let factory = LlmEngineFactory::new(
        ModelCatalog::with_entries(&config.models),
        config.llm.clone(),
        config.engine.clone(),
        Workspace::new(root.clone()),
        Handle::current(),
    );
    let spec = factory.primary_spec(cli.reasoning_effort.clone(), cli.thinking_tokens.clone());

    let (sink, events) = EventSink::channel();
    let orchestrator = Orchestrator::new(Arc::new(factory), spec, sink.clone(), config.session.clone(), root)
        .await
        .context("Failed to create engine")?;

    let endpoint = Endpoint::parse(&config.server.resolve_url(cli.server.as_deref()))?;
    info!(%endpoint, "cmd_connect: connecting to peer");
    let (reader, writer) =
        connect_with_retry(&endpoint, config.server.connect_retries, config.server.retry_backoff()).await?;

    let transcript = if config.session.transcript {
        let session_id = Uuid::now_v7().to_string();
        match TranscriptLogger::with_default_path(&session_id) {
            Ok(logger) => {
                info!(path = %logger.path().display(), "cmd_connect: writing transcript");
                Some(logger)
            }
            Err(e) => {
                warn!(error = %e, "cmd_connect: transcript disabled");
                None
            }
        }
    } else {
        None
    };

    let options = ServeOptions {
        action_delay: config.session.action_delay(),
        transcript,
    };
    serve(reader, writer, orchestrator, sink, events, options).await?;
    info!("cmd_connect: session ended");
    Ok(())
}

fn cmd_config(config: &Config) -> Result<()> {
    let yaml = serde_yaml::to_string(config).context("Failed to serialize configuration")?;
    print!("{}", yaml);
    Ok(())
}

fn cmd_models(config: &Config) -> Result<()> {
    let catalog = ModelCatalog::with_entries(&config.models);
    println!(
        "{:<24} {:<10} {:>10} {:>10} {:>10}",
        "MODEL", "PROVIDER", "IN $/M", "OUT $/M", "CONTEXT"
    );
    for entry in catalog.entries() {
        println!(
            "{:<24} {:<10} {:>10.2} {:>10.2} {:>10}",
            entry.name,
            entry.provider,
            entry.input_cost_per_token * 1_000_000.0,
            entry.output_cost_per_token * 1_000_000.0,
            entry.max_input_tokens
        );
    }
    Ok(())
}
