//! Agent engine interface
//!
//! The engine executes prompts and produces incremental text output, file
//! edits, and cost metadata. The session layer only drives it through the
//! traits in this module:
//!
//! - [`Engine`] - one configured engine instance (model, mode, history)
//! - [`ChunkSource`] - the lazy, pull-based output of a single prompt
//! - [`EngineFactory`] - builds engines, optionally deriving from another one
//! - [`EngineIo`] - callbacks the engine makes into the session (tool output,
//!   confirmations)
//!
//! Engine methods may block (network, subprocesses, confirmations) and must
//! only be called from blocking contexts such as `spawn_blocking`.

use std::sync::Arc;

mod edits;
mod error;
mod llm_engine;
mod models;
mod types;
mod workspace;

pub use edits::{WholeFileEdit, parse_whole_file_edits};
pub use error::EngineError;
pub use llm_engine::{EDITS_APPLIED_ACK, LlmEngine, LlmEngineFactory, parse_token_budget};
pub use models::{ModelCatalog, ModelEntry};
pub use types::{
    Autocompletion, ChatMessage, CommitInfo, ContextFile, EngineSpec, FileEdit, History, Mode, ModelInfo,
    ModelSelection, Question, QuestionKind, Role, TokenCost, TokensInfo,
};
pub use workspace::{CommandOutput, Workspace, find_repo_root};

/// Lazy, pull-based, finite sequence of output chunks for one prompt
///
/// `next_chunk` may block. `None` means the sequence is exhausted; a source
/// is never restarted.
pub trait ChunkSource: Send {
    fn next_chunk(&mut self) -> Option<Result<String, EngineError>>;
}

impl<I> ChunkSource for I
where
    I: Iterator<Item = Result<String, EngineError>> + Send,
{
    fn next_chunk(&mut self) -> Option<Result<String, EngineError>> {
        self.next()
    }
}

/// Callbacks from an engine into the session
pub trait EngineIo: Send + Sync {
    /// Informational output
    fn tool_output(&self, message: &str);

    fn tool_warning(&self, message: &str);

    fn tool_error(&self, message: &str);

    /// Ask the peer a yes/no question, blocking until it answers
    fn confirm_ask(&self, question: Question) -> bool;
}

/// A configured agent engine
pub trait Engine: Send + Sync {
    fn mode(&self) -> Mode;

    fn model(&self) -> ModelInfo;

    /// Start running a prompt, returning its chunk source
    fn run_stream(&self, prompt: &str) -> Box<dyn ChunkSource>;

    /// Output of the most recent run, for engines that don't stream
    fn partial_response(&self) -> String;

    /// Paths edited by the most recent run
    fn edited_files(&self) -> Vec<String>;

    fn usage_report(&self) -> Option<String> {
        None
    }

    fn last_commit(&self) -> Option<CommitInfo> {
        None
    }

    fn diff_commits(&self, from: &str, to: &str) -> Result<String, EngineError> {
        Err(EngineError::Unsupported(format!("diff {}..{}", from, to)))
    }

    /// Follow-up prompt the engine wants re-run
    fn reflected_message(&self) -> Option<String> {
        None
    }

    fn total_cost(&self) -> f64;

    fn set_total_cost(&self, cost: f64);

    fn commit_hashes(&self) -> Vec<String> {
        Vec::new()
    }

    fn set_commit_hashes(&self, _hashes: Vec<String>) {}

    fn history(&self) -> History;

    fn set_history(&self, history: History);

    fn push_cur_message(&self, message: ChatMessage) {
        let mut history = self.history();
        history.cur.push(message);
        self.set_history(history);
    }

    fn push_done_message(&self, message: ChatMessage) {
        let mut history = self.history();
        history.done.push(message);
        self.set_history(history);
    }

    /// Settle the current exchange and record an assistant acknowledgement
    fn move_back_cur_messages(&self, acknowledgement: &str) {
        let mut history = self.history();
        history.move_back(acknowledgement);
        self.set_history(history);
    }

    fn context_files(&self) -> Vec<ContextFile>;

    fn add_file(&self, path: &str, read_only: bool) -> Result<(), EngineError>;

    fn drop_file(&self, path: &str) -> Result<(), EngineError>;

    fn apply_edits(&self, edits: &[FileEdit]) -> Result<(), EngineError> {
        Err(EngineError::Unsupported(format!("apply {} edits", edits.len())))
    }

    fn run_command(&self, command: &str) -> Result<(), EngineError> {
        Err(EngineError::InvalidCommand(command.to_string()))
    }

    /// Lines announcing the engine's configuration
    fn announcements(&self) -> Vec<String> {
        Vec::new()
    }

    fn repo_map(&self) -> Option<String> {
        None
    }

    fn autocompletion(&self) -> Result<Autocompletion, EngineError> {
        Ok(Autocompletion::default())
    }

    fn tokens_info(&self) -> TokensInfo {
        TokensInfo::default()
    }

    fn set_reasoning_effort(&self, _effort: Option<String>) {}

    fn set_thinking_tokens(&self, _tokens: Option<String>) {}
}

/// Builds engines
pub trait EngineFactory: Send + Sync {
    /// Create an engine from `spec`
    ///
    /// When `from` is given the new engine inherits its cost, commit hashes,
    /// context files and, unless `spec.history` overrides it, its history.
    fn create(
        &self,
        spec: EngineSpec,
        from: Option<&Arc<dyn Engine>>,
        io: Arc<dyn EngineIo>,
    ) -> Result<Arc<dyn Engine>, EngineError>;

    /// Sanity-check a model name, returning warnings for the peer
    fn check_model(&self, name: &str) -> Vec<String>;

    /// Every model name the peer may choose from
    fn known_models(&self) -> Vec<String>;
}
