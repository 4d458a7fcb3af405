//! ConfirmationBroker - the engine's window onto the peer
//!
//! Implements [`EngineIo`]: tool output, warnings and errors become `log`
//! events, and `confirm_ask` turns into an `ask-question` event followed by a
//! blocking wait on the correlation register.
//!
//! Some answers carry side effects keyed on the question kind:
//!
//! - an approved `EditFiles` during a prompt run hands the run's output to an
//!   editor pass and reports "no" upward, so the engine's own edit path stays
//!   idle
//! - an approved `RunShellCommand` starts command-output tracking
//! - `AddCommandOutput` ends it, whatever the answer

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};

use super::mergeback::EditorPass;
use super::pipe::StreamingPipe;
use super::register::TakeError;
use super::state::{ExecutionHandle, SessionShared};
use crate::config::SessionConfig;
use crate::engine::{EngineFactory, EngineIo, Question, QuestionKind};
use crate::events::EventSink;

/// Warnings the peer never needs to see
const IGNORED_WARNINGS: &[&str] = &[
    "Warning: it's best to only add files that need changes to the chat.",
    "https://aider.chat/docs/troubleshooting/edit-errors.html",
];

/// Error suffixes the peer never needs to see
const IGNORED_ERROR_SUFFIXES: &[&str] = &[
    "is already in the chat as a read-only file",
    "is already in the chat as an editable file",
];

/// Only the token `y` means yes; anything else declines
pub fn is_affirmative(answer: &str) -> bool {
    answer.trim() == "y"
}

/// Timing knobs for confirmations and the editor pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrokerSettings {
    pub poll: Duration,
    /// `None` waits for an answer indefinitely
    pub timeout: Option<Duration>,
    pub chunk_yield: Duration,
}

impl From<&SessionConfig> for BrokerSettings {
    fn from(config: &SessionConfig) -> Self {
        Self {
            poll: config.confirmation_poll(),
            timeout: config.confirmation_timeout(),
            chunk_yield: config.chunk_yield(),
        }
    }
}

pub struct ConfirmationBroker {
    shared: Arc<SessionShared>,
    sink: EventSink,
    factory: Arc<dyn EngineFactory>,
    runtime: Handle,
    settings: BrokerSettings,
    this: Weak<ConfirmationBroker>,
}

impl ConfirmationBroker {
    pub fn new(
        shared: Arc<SessionShared>,
        sink: EventSink,
        factory: Arc<dyn EngineFactory>,
        runtime: Handle,
        settings: BrokerSettings,
    ) -> Arc<Self> {
        debug!(?settings, "ConfirmationBroker::new: called");
        Arc::new_cyclic(|this| Self {
            shared,
            sink,
            factory,
            runtime,
            settings,
            this: this.clone(),
        })
    }

    /// Capture output of the shell command about to run
    pub fn start_command_tracking(&self) {
        debug!("ConfirmationBroker::start_command_tracking: called");
        let mut commands = self.shared.commands();
        commands.running_shell_command = true;
        commands.current_command = None;
    }

    pub fn stop_command_tracking(&self) {
        debug!("ConfirmationBroker::stop_command_tracking: called");
        self.shared.commands().running_shell_command = false;
    }

    /// Drop all command tracking, closing the named command for the peer
    pub fn reset_state(&self) {
        if let Some(command) = self.shared.end_command_tracking() {
            debug!(%command, "ConfirmationBroker::reset_state: closing command output");
            self.sink.use_command_output(&command, true);
        }
    }

    /// Emit the question and block until the peer answers
    fn wait_for_answer(&self, question: &Question) -> String {
        let register = self.shared.register();
        register.clear();
        self.sink.ask_question(question);

        match register.take_blocking(self.settings.poll, self.settings.timeout) {
            Ok(answer) => answer,
            Err(TakeError::Closed) => {
                debug!("ConfirmationBroker::wait_for_answer: session closed, declining");
                String::new()
            }
            Err(TakeError::TimedOut) => {
                warn!(question = %question.text, "ConfirmationBroker::wait_for_answer: timed out");
                self.sink
                    .warning(format!("No answer to '{}' in time, declining.", question.text));
                String::new()
            }
        }
    }

    /// Run the editor pass for an approved plan; blocks this thread
    fn hand_off_to_editor(&self, execution: Arc<ExecutionHandle>) {
        let Some(io) = self.this.upgrade() else {
            return;
        };
        info!("ConfirmationBroker::hand_off_to_editor: plan approved, starting editor pass");
        let pipe = StreamingPipe::new(self.shared.clone(), self.sink.clone(), self.settings.chunk_yield);
        let pass = EditorPass::new(self.factory.clone(), pipe, self.sink.clone());

        if let Err(e) = self.runtime.block_on(pass.run(&execution, io)) {
            error!(error = %e, "ConfirmationBroker::hand_off_to_editor: editor pass failed");
            self.tool_error(&format!("Editor pass failed: {}", e));
        }
    }
}

impl EngineIo for ConfirmationBroker {
    fn tool_output(&self, message: &str) {
        info!(%message, "engine output");
        let mut commands = self.shared.commands();
        if !commands.running_shell_command {
            return;
        }

        if commands.current_command.is_none()
            && let Some(command) = message.strip_prefix("Running ")
        {
            commands.current_command = Some(command.to_string());
            drop(commands);
            self.sink.use_command_output(command, false);
            return;
        }
        drop(commands);
        self.sink.info(message);
    }

    fn tool_warning(&self, message: &str) {
        warn!(%message, "engine warning");
        if !IGNORED_WARNINGS.contains(&message) {
            self.sink.warning(message);
        }
    }

    fn tool_error(&self, message: &str) {
        error!(%message, "engine error");
        if !IGNORED_ERROR_SUFFIXES.iter().any(|suffix| message.ends_with(suffix)) {
            self.sink.error(message);
        }
    }

    fn confirm_ask(&self, question: Question) -> bool {
        debug!(kind = ?question.kind, text = %question.text, "ConfirmationBroker::confirm_ask: called");
        if !self.shared.is_connected() {
            debug!("ConfirmationBroker::confirm_ask: no peer attached");
            return false;
        }
        if !self.shared.begin_question() {
            error!(text = %question.text, "ConfirmationBroker::confirm_ask: question already pending, declining");
            return false;
        }

        let answer = self.wait_for_answer(&question);
        self.shared.end_question();
        let yes = is_affirmative(&answer);
        debug!(%answer, %yes, "ConfirmationBroker::confirm_ask: answered");

        match question.kind {
            QuestionKind::EditFiles if yes => {
                if let Some(execution) = self.shared.active().filter(|e| !e.is_handed_off()) {
                    self.hand_off_to_editor(execution);
                    return false;
                }
            }
            QuestionKind::RunShellCommand if yes => self.start_command_tracking(),
            QuestionKind::AddCommandOutput => self.reset_state(),
            _ => {}
        }

        yes
    }
}
