//! Inbound message types
//!
//! Newline-delimited JSON. Every message is an object with an `action` key;
//! the remaining keys are camelCase. A known action missing a required field
//! (or carrying an empty one) is skipped rather than reported.

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::engine::FileEdit;
use crate::events::LISTEN_TO;

/// Messages from the peer
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "action", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum InboundAction {
    Prompt {
        prompt: String,
        #[serde(default)]
        mode: Option<String>,
        #[serde(default)]
        architect_model: Option<String>,
        #[serde(default)]
        prompt_id: Option<String>,
        #[serde(default)]
        clear_context: Option<bool>,
    },
    AnswerQuestion {
        answer: String,
    },
    AddFile {
        path: String,
        #[serde(default)]
        read_only: Option<bool>,
    },
    DropFile {
        path: String,
    },
    SetModels {
        main_model: String,
        #[serde(default)]
        weak_model: Option<String>,
    },
    RunCommand {
        command: String,
    },
    AddMessage {
        content: String,
        #[serde(default)]
        role: Option<String>,
        #[serde(default)]
        acknowledge: Option<bool>,
    },
    InterruptResponse,
    ApplyEdits {
        edits: Vec<FileEdit>,
    },
}

impl InboundAction {
    /// Wire name of the action
    pub fn kind(&self) -> &'static str {
        match self {
            InboundAction::Prompt { .. } => "prompt",
            InboundAction::AnswerQuestion { .. } => "answer-question",
            InboundAction::AddFile { .. } => "add-file",
            InboundAction::DropFile { .. } => "drop-file",
            InboundAction::SetModels { .. } => "set-models",
            InboundAction::RunCommand { .. } => "run-command",
            InboundAction::AddMessage { .. } => "add-message",
            InboundAction::InterruptResponse => "interrupt-response",
            InboundAction::ApplyEdits { .. } => "apply-edits",
        }
    }

    fn has_required_content(&self) -> bool {
        match self {
            InboundAction::Prompt { prompt, .. } => !prompt.is_empty(),
            InboundAction::AddFile { path, .. } | InboundAction::DropFile { path } => !path.is_empty(),
            InboundAction::SetModels { main_model, .. } => !main_model.is_empty(),
            InboundAction::RunCommand { command } => !command.is_empty(),
            InboundAction::AddMessage { content, .. } => !content.is_empty(),
            InboundAction::ApplyEdits { edits } => !edits.is_empty(),
            InboundAction::AnswerQuestion { .. } | InboundAction::InterruptResponse => true,
        }
    }
}

/// Inbound messages that can't be dispatched
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("Message is not a JSON object")]
    NotAnObject,

    #[error("No action specified")]
    MissingAction,

    #[error("Unknown action: {0}")]
    UnknownAction(String),
}

/// Parse one inbound line
///
/// `Ok(None)` means a known action was skipped for missing fields.
pub fn parse_inbound(line: &str) -> Result<Option<InboundAction>, ProtocolError> {
    let value: Value = serde_json::from_str(line.trim())?;
    let Some(object) = value.as_object() else {
        return Err(ProtocolError::NotAnObject);
    };

    let action = match object.get("action").and_then(Value::as_str) {
        Some(action) if !action.is_empty() => action.to_string(),
        _ => return Err(ProtocolError::MissingAction),
    };
    if !LISTEN_TO.contains(&action.as_str()) {
        return Err(ProtocolError::UnknownAction(action));
    }

    match serde_json::from_value::<InboundAction>(value) {
        Ok(parsed) if parsed.has_required_content() => {
            debug!(action = parsed.kind(), "parse_inbound: parsed action");
            Ok(Some(parsed))
        }
        Ok(_) => {
            debug!(%action, "parse_inbound: empty required field, skipping");
            Ok(None)
        }
        Err(e) => {
            warn!(%action, error = %e, "parse_inbound: malformed fields, skipping");
            Ok(None)
        }
    }
}
