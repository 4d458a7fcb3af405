//! Engine-facing data types
//!
//! These are the values exchanged between the session layer and an engine:
//! chat history, model selection, confirmation questions, and the projections
//! sent to the peer (context files, autocompletion, token estimates).

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Edit mode an engine runs under
///
/// `Code` is the session's default mode. Every other mode runs as a
/// sub-execution when requested by a prompt.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum Mode {
    #[default]
    Code,
    Ask,
    Architect,
    Editor,
    Other(String),
}

impl Mode {
    pub fn as_str(&self) -> &str {
        match self {
            Mode::Code => "code",
            Mode::Ask => "ask",
            Mode::Architect => "architect",
            Mode::Editor => "editor",
            Mode::Other(s) => s,
        }
    }

    /// Whether this is the session's default mode
    pub fn is_default(&self) -> bool {
        matches!(self, Mode::Code)
    }
}

impl From<&str> for Mode {
    fn from(s: &str) -> Self {
        match s {
            "code" => Mode::Code,
            "ask" => Mode::Ask,
            "architect" => Mode::Architect,
            "editor" | "editor-whole" | "editor-diff" => Mode::Editor,
            other => Mode::Other(other.to_string()),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Serialize for Mode {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Mode {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Mode::from(s.as_str()))
    }
}

/// Role of a chat message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    /// Parse a peer-supplied role, defaulting to `User`
    pub fn parse(s: &str) -> Self {
        match s {
            "assistant" => Role::Assistant,
            "system" => Role::System,
            _ => Role::User,
        }
    }
}

/// A single chat message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Conversation history: settled messages plus the in-flight exchange
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct History {
    pub done: Vec<ChatMessage>,
    pub cur: Vec<ChatMessage>,
}

impl History {
    pub fn is_empty(&self) -> bool {
        self.done.is_empty() && self.cur.is_empty()
    }

    /// All messages in order (`done` then `cur`)
    pub fn all(&self) -> Vec<ChatMessage> {
        self.done.iter().chain(self.cur.iter()).cloned().collect()
    }

    /// Move `cur` into `done`, followed by an assistant acknowledgement
    pub fn move_back(&mut self, acknowledgement: &str) {
        debug!(cur = self.cur.len(), "History::move_back: called");
        self.done.append(&mut self.cur);
        if !acknowledgement.is_empty() {
            self.done.push(ChatMessage::assistant(acknowledgement));
        }
    }
}

/// A commit produced by an engine run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitInfo {
    pub hash: String,
    pub message: String,
}

/// A file in the chat context
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextFile {
    pub path: String,
    pub read_only: bool,
}

/// A peer-supplied edit: replace `original` with `updated` in `path`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEdit {
    pub path: String,
    pub original: String,
    pub updated: String,
}

/// Which models an engine should use
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ModelSelection {
    pub main: String,
    pub weak: Option<String>,
    pub editor: Option<String>,
    pub editor_edit_format: Option<String>,
}

impl ModelSelection {
    pub fn new(main: impl Into<String>) -> Self {
        Self {
            main: main.into(),
            ..Default::default()
        }
    }

    pub fn with_weak(mut self, weak: Option<String>) -> Self {
        self.weak = weak;
        self
    }

    pub fn with_editor(mut self, editor: Option<String>) -> Self {
        self.editor = editor;
        self
    }
}

/// Snapshot of the model an engine is running
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelInfo {
    pub name: String,
    pub weak_model: String,
    pub editor_model: Option<String>,
    pub editor_edit_format: Option<String>,
    pub reasoning_effort: Option<String>,
    pub thinking_tokens: Option<String>,
    /// Provider metadata forwarded to the peer as-is
    pub info: serde_json::Value,
    /// Environment variables the model needs but which are unset
    pub missing_keys: Vec<String>,
    pub input_cost_per_token: f64,
}

impl ModelInfo {
    /// The selection that reproduces this model
    pub fn selection(&self) -> ModelSelection {
        ModelSelection {
            main: self.name.clone(),
            weak: Some(self.weak_model.clone()),
            editor: self.editor_model.clone(),
            editor_edit_format: self.editor_edit_format.clone(),
        }
    }
}

/// Everything an engine factory needs to build an engine
#[derive(Debug, Clone, PartialEq)]
pub struct EngineSpec {
    pub mode: Mode,
    pub model: ModelSelection,
    pub suggest_shell_commands: bool,
    pub cache_prompts: bool,
    /// Summarize the history inherited from the source engine
    pub summarize_history: bool,
    pub repo_map: bool,
    /// Replaces the history inherited from the source engine
    pub history: Option<History>,
    /// Replaces the cost inherited from the source engine
    pub total_cost: Option<f64>,
    pub reasoning_effort: Option<String>,
    pub thinking_tokens: Option<String>,
}

impl EngineSpec {
    pub fn new(mode: Mode, model: ModelSelection) -> Self {
        Self {
            mode,
            model,
            suggest_shell_commands: true,
            cache_prompts: true,
            summarize_history: true,
            repo_map: true,
            history: None,
            total_cost: None,
            reasoning_effort: None,
            thinking_tokens: None,
        }
    }

    pub fn with_history(mut self, history: History) -> Self {
        self.history = Some(history);
        self
    }

    pub fn without_summarization(mut self) -> Self {
        self.summarize_history = false;
        self
    }
}

/// What a confirmation question is about
///
/// The session reacts to some questions with side effects, so the kind is
/// carried explicitly instead of being inferred from the text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuestionKind {
    EditFiles,
    RunShellCommand,
    AddCommandOutput,
    CreateFile,
    Other,
}

/// A yes/no question the engine needs the peer to answer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    pub kind: QuestionKind,
    pub text: String,
    pub subject: Option<String>,
    pub default_answer: String,
    pub explicit_yes_required: bool,
}

impl Question {
    pub fn new(kind: QuestionKind, text: impl Into<String>) -> Self {
        Self {
            kind,
            text: text.into(),
            subject: None,
            default_answer: "y".to_string(),
            explicit_yes_required: false,
        }
    }

    pub fn edit_files() -> Self {
        Self::new(QuestionKind::EditFiles, "Edit the files?")
    }

    pub fn run_shell_commands(commands: &[String]) -> Self {
        let text = if commands.len() == 1 {
            "Run shell command?"
        } else {
            "Run shell commands?"
        };
        Self::new(QuestionKind::RunShellCommand, text)
            .with_subject(commands.join("\n"))
            .explicit()
    }

    pub fn add_command_output() -> Self {
        Self::new(QuestionKind::AddCommandOutput, "Add command output to the chat?")
    }

    pub fn create_file(path: &str) -> Self {
        Self::new(QuestionKind::CreateFile, "Create new file?").with_subject(path)
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn with_default(mut self, default_answer: impl Into<String>) -> Self {
        self.default_answer = default_answer.into();
        self
    }

    pub fn explicit(mut self) -> Self {
        self.explicit_yes_required = true;
        self
    }
}

/// Autocompletion vocabulary for the peer's input box
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Autocompletion {
    pub words: Vec<String>,
    pub all_files: Vec<String>,
}

/// Token count and cost estimate for one context component
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenCost {
    pub tokens: u64,
    pub cost: f64,
}

impl TokenCost {
    pub fn new(tokens: u64, cost_per_token: f64) -> Self {
        Self {
            tokens,
            cost: tokens as f64 * cost_per_token,
        }
    }
}

/// Token usage estimate of everything the next prompt would send
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokensInfo {
    pub system_messages: TokenCost,
    pub chat_history: TokenCost,
    pub repo_map: TokenCost,
    pub files: BTreeMap<String, TokenCost>,
}
