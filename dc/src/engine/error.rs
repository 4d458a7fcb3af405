//! Engine error types

use std::path::PathBuf;
use thiserror::Error;

use crate::llm::LlmError;

/// Errors raised by an engine while running prompts or commands
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Not a git repository: {0}")]
    NotARepository(PathBuf),

    #[error("Path {path} escapes base directory {base_dir}")]
    OutsideBaseDir { path: PathBuf, base_dir: PathBuf },

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("String pattern not found in {path}")]
    PatternNotFound { path: String },

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    #[error("Unknown model: {0}")]
    UnknownModel(String),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}
