//! Session state shared between the gateway reader and the execution side
//!
//! The reader only ever touches the interruption flag and the correlation
//! register. Everything else is written by the orchestrator (or the broker
//! acting on its behalf while a prompt runs).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use super::register::CorrelationRegister;
use crate::engine::Engine;

/// A prompt run in progress
///
/// Holds the engine the run uses and the text streamed so far, so a
/// confirmation raised mid-run can hand the output to an editor pass.
pub struct ExecutionHandle {
    engine: Arc<dyn Engine>,
    content: Mutex<String>,
    handed_off: AtomicBool,
}

impl ExecutionHandle {
    pub fn new(engine: Arc<dyn Engine>) -> Self {
        Self {
            engine,
            content: Mutex::new(String::new()),
            handed_off: AtomicBool::new(false),
        }
    }

    pub fn engine(&self) -> &Arc<dyn Engine> {
        &self.engine
    }

    fn content_lock(&self) -> MutexGuard<'_, String> {
        self.content.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn append(&self, chunk: &str) {
        self.content_lock().push_str(chunk);
    }

    pub fn content(&self) -> String {
        self.content_lock().clone()
    }

    pub fn set_content(&self, content: String) {
        *self.content_lock() = content;
    }

    /// Mark that an editor pass took over this run's output
    pub fn hand_off(&self) {
        self.handed_off.store(true, Ordering::SeqCst);
    }

    pub fn is_handed_off(&self) -> bool {
        self.handed_off.load(Ordering::SeqCst)
    }
}

/// Shell-command output capture
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CommandTracking {
    pub running_shell_command: bool,
    pub current_command: Option<String>,
}

/// State shared by every session task
#[derive(Default)]
pub struct SessionShared {
    interrupted: AtomicBool,
    connected: AtomicBool,
    pending_question: AtomicBool,
    register: CorrelationRegister,
    commands: Mutex<CommandTracking>,
    active: Mutex<Option<Arc<ExecutionHandle>>>,
}

impl SessionShared {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self) -> &CorrelationRegister {
        &self.register
    }

    pub fn interrupt(&self) {
        debug!("SessionShared::interrupt: called");
        self.interrupted.store(true, Ordering::SeqCst);
    }

    pub fn clear_interrupted(&self) {
        self.interrupted.store(false, Ordering::SeqCst);
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    /// Entry reset run for every inbound action
    ///
    /// Clears the interrupt flag and command tracking, returning the command
    /// whose output was being captured, if one was named.
    pub fn reset_for_action(&self) -> Option<String> {
        self.clear_interrupted();
        self.end_command_tracking()
    }

    /// Stop capturing command output, returning the named command if any
    pub fn end_command_tracking(&self) -> Option<String> {
        let mut commands = self.commands();
        commands.running_shell_command = false;
        commands.current_command.take()
    }

    pub fn set_connected(&self, connected: bool) {
        debug!(%connected, "SessionShared::set_connected: called");
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Peer went away: stop streaming and release any confirmation wait
    pub fn disconnect(&self) {
        debug!("SessionShared::disconnect: called");
        self.set_connected(false);
        self.interrupt();
        self.register.close();
    }

    /// Claim the single confirmation slot; false if one is outstanding
    pub fn begin_question(&self) -> bool {
        !self.pending_question.swap(true, Ordering::SeqCst)
    }

    pub fn end_question(&self) {
        self.pending_question.store(false, Ordering::SeqCst);
    }

    pub fn has_pending_question(&self) -> bool {
        self.pending_question.load(Ordering::SeqCst)
    }

    pub fn commands(&self) -> MutexGuard<'_, CommandTracking> {
        self.commands.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn active_lock(&self) -> MutexGuard<'_, Option<Arc<ExecutionHandle>>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_active(&self, execution: Option<Arc<ExecutionHandle>>) {
        debug!(active = execution.is_some(), "SessionShared::set_active: called");
        *self.active_lock() = execution;
    }

    pub fn active(&self) -> Option<Arc<ExecutionHandle>> {
        self.active_lock().clone()
    }
}
