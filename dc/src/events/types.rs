//! Outbound event vocabulary
//!
//! Every message the session sends to the peer. Events serialize as one JSON
//! object tagged by `action`, with camelCase fields.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::engine::{ContextFile, TokensInfo};

/// Inbound action kinds announced in the `init` event
pub const LISTEN_TO: &[&str] = &[
    "prompt",
    "add-file",
    "drop-file",
    "answer-question",
    "set-models",
    "run-command",
    "add-message",
    "interrupt-response",
    "apply-edits",
];

/// Level of a peer-visible log message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
    Loading,
}

/// Body of a `response` event, progress or terminal
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponsePayload {
    pub content: String,
    pub finished: bool,

    /// Prompt of the reflection iteration this belongs to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reflected_message: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub edited_files: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage_report: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit_hash: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit_message: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub diff: Option<String>,

    /// Set on a terminal event whose stream was cut short
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interrupted: Option<bool>,
}

impl ResponsePayload {
    /// One streamed chunk
    pub fn progress(chunk: impl Into<String>, reflected_message: Option<&str>) -> Self {
        Self {
            content: chunk.into(),
            finished: false,
            reflected_message: reflected_message.map(String::from),
            ..Default::default()
        }
    }

    /// Closes a planning phase before its editor pass streams
    pub fn planning_finished(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            finished: true,
            ..Default::default()
        }
    }
}

/// Everything the session sends to the peer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum OutboundEvent {
    Init {
        base_dir: String,
        listen_to: Vec<String>,
        input_history_file: Option<String>,
    },
    Response(ResponsePayload),
    AskQuestion {
        question: String,
        subject: Option<String>,
        default_answer: String,
    },
    Log {
        level: LogLevel,
        message: String,
    },
    UpdateAutocompletion {
        words: Vec<String>,
        all_files: Vec<String>,
        models: Vec<String>,
    },
    UpdateRepoMap {
        repo_map: String,
    },
    UpdateContextFiles {
        files: Vec<ContextFile>,
    },
    SetModels {
        main_model: String,
        weak_model: String,
        reasoning_effort: Option<String>,
        thinking_tokens: Option<String>,
        info: serde_json::Value,
        error: Option<String>,
    },
    TokensInfo {
        info: TokensInfo,
    },
    PromptFinished {
        prompt_id: String,
    },
    UseCommandOutput {
        command: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        finished: Option<bool>,
    },
    /// Payload for a failed or unknown inbound action
    Error {
        error: String,
    },
}

impl OutboundEvent {
    /// Wire name of the event
    pub fn event_type(&self) -> &'static str {
        match self {
            OutboundEvent::Init { .. } => "init",
            OutboundEvent::Response(_) => "response",
            OutboundEvent::AskQuestion { .. } => "ask-question",
            OutboundEvent::Log { .. } => "log",
            OutboundEvent::UpdateAutocompletion { .. } => "update-autocompletion",
            OutboundEvent::UpdateRepoMap { .. } => "update-repo-map",
            OutboundEvent::UpdateContextFiles { .. } => "update-context-files",
            OutboundEvent::SetModels { .. } => "set-models",
            OutboundEvent::TokensInfo { .. } => "tokens-info",
            OutboundEvent::PromptFinished { .. } => "prompt-finished",
            OutboundEvent::UseCommandOutput { .. } => "use-command-output",
            OutboundEvent::Error { .. } => "error",
        }
    }

    /// Streamed chunks are sent back to back; everything else is paced
    pub fn is_progress(&self) -> bool {
        matches!(self, OutboundEvent::Response(r) if !r.finished)
    }
}

/// A transcript line: the event plus when it was sent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub timestamp: DateTime<Utc>,
    pub event: OutboundEvent,
}

impl TranscriptEntry {
    pub fn new(event: OutboundEvent) -> Self {
        Self {
            timestamp: Utc::now(),
            event,
        }
    }
}
