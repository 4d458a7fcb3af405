//! Event sink - the single ordered path to the peer
//!
//! Every producer (orchestrator, confirmation broker, streaming pipe, gateway)
//! holds a clone of the sink. Events go through one unbounded channel, so the
//! peer sees them in exactly the order they were emitted. Emitting never
//! blocks, which makes the sink usable from engine threads.

use tokio::sync::mpsc;
use tracing::debug;

use super::types::{LogLevel, OutboundEvent, ResponsePayload};
use crate::engine::{ContextFile, Question, TokensInfo};

/// Handle for emitting outbound events
///
/// Cheap to clone. Once the writer side is gone every emit is dropped and
/// reports `false`.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<OutboundEvent>,
}

impl EventSink {
    /// Create a sink and the receiver its writer drains
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<OutboundEvent>) {
        debug!("EventSink::channel: called");
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Emit a raw event, returning whether the writer is still there
    pub fn emit(&self, event: OutboundEvent) -> bool {
        debug!(event_type = event.event_type(), "EventSink::emit");
        self.tx.send(event).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    // === Convenience methods ===

    pub fn response(&self, payload: ResponsePayload) -> bool {
        self.emit(OutboundEvent::Response(payload))
    }

    /// Emit one streamed chunk
    pub fn progress(&self, chunk: &str, reflected_message: Option<&str>) -> bool {
        self.response(ResponsePayload::progress(chunk, reflected_message))
    }

    pub fn log(&self, level: LogLevel, message: impl Into<String>) -> bool {
        self.emit(OutboundEvent::Log {
            level,
            message: message.into(),
        })
    }

    pub fn info(&self, message: impl Into<String>) -> bool {
        self.log(LogLevel::Info, message)
    }

    pub fn warning(&self, message: impl Into<String>) -> bool {
        self.log(LogLevel::Warning, message)
    }

    pub fn error(&self, message: impl Into<String>) -> bool {
        self.log(LogLevel::Error, message)
    }

    pub fn loading(&self, message: impl Into<String>) -> bool {
        self.log(LogLevel::Loading, message)
    }

    pub fn ask_question(&self, question: &Question) -> bool {
        self.emit(OutboundEvent::AskQuestion {
            question: question.text.clone(),
            subject: question.subject.clone(),
            default_answer: question.default_answer.clone(),
        })
    }

    pub fn context_files(&self, files: Vec<ContextFile>) -> bool {
        self.emit(OutboundEvent::UpdateContextFiles { files })
    }

    pub fn tokens_info(&self, info: TokensInfo) -> bool {
        self.emit(OutboundEvent::TokensInfo { info })
    }

    pub fn repo_map(&self, repo_map: String) -> bool {
        self.emit(OutboundEvent::UpdateRepoMap { repo_map })
    }

    pub fn prompt_finished(&self, prompt_id: &str) -> bool {
        self.emit(OutboundEvent::PromptFinished {
            prompt_id: prompt_id.to_string(),
        })
    }

    /// Announce (or, with `finished`, close) captured command output
    pub fn use_command_output(&self, command: &str, finished: bool) -> bool {
        self.emit(OutboundEvent::UseCommandOutput {
            command: command.to_string(),
            finished: finished.then_some(true),
        })
    }

    /// Error payload answering a failed inbound action
    pub fn error_payload(&self, error: impl Into<String>) -> bool {
        self.emit(OutboundEvent::Error { error: error.into() })
    }
}
