//! CorrelationRegister - single-slot answer store
//!
//! Bridges an answer delivered by the gateway into a confirmation request
//! that blocks its thread. Setting overwrites any unconsumed value; taking
//! clears it. There is no queue: the orchestrator guarantees at most one
//! outstanding request.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::debug;

#[derive(Debug, Default)]
struct Slot {
    value: Option<String>,
    closed: bool,
}

/// Why a blocking take returned without an answer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TakeError {
    /// The session shut down while waiting
    Closed,
    /// No answer arrived within the configured bound
    TimedOut,
}

/// Single-slot, last-write-wins answer register
#[derive(Debug, Default)]
pub struct CorrelationRegister {
    slot: Mutex<Slot>,
    ready: Condvar,
}

impl CorrelationRegister {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store an answer, replacing any unconsumed one, and wake the waiter
    pub fn set(&self, answer: impl Into<String>) {
        let answer = answer.into();
        debug!(%answer, "CorrelationRegister::set: called");
        let mut slot = self.lock();
        if let Some(previous) = slot.value.replace(answer) {
            debug!(%previous, "CorrelationRegister::set: overwrote unconsumed answer");
        }
        self.ready.notify_all();
    }

    /// Drop any unconsumed answer
    pub fn clear(&self) {
        debug!("CorrelationRegister::clear: called");
        self.lock().value = None;
    }

    /// Release every waiter; later takes fail with `Closed`
    pub fn close(&self) {
        debug!("CorrelationRegister::close: called");
        let mut slot = self.lock();
        slot.closed = true;
        self.ready.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Whether an answer is waiting to be taken
    pub fn is_occupied(&self) -> bool {
        self.lock().value.is_some()
    }

    /// Block the calling thread until an answer is present, then take it
    ///
    /// Wakes on `set` and re-checks at least every `poll` interval. With
    /// `timeout` set the wait is bounded; otherwise it lasts until an answer
    /// arrives or the register is closed.
    pub fn take_blocking(&self, poll: Duration, timeout: Option<Duration>) -> Result<String, TakeError> {
        debug!(?poll, ?timeout, "CorrelationRegister::take_blocking: called");
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut slot = self.lock();

        loop {
            if let Some(answer) = slot.value.take() {
                debug!(%answer, "CorrelationRegister::take_blocking: answer taken");
                return Ok(answer);
            }
            if slot.closed {
                debug!("CorrelationRegister::take_blocking: register closed");
                return Err(TakeError::Closed);
            }

            let wait = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        debug!("CorrelationRegister::take_blocking: timed out");
                        return Err(TakeError::TimedOut);
                    }
                    poll.min(deadline - now)
                }
                None => poll,
            };

            slot = self
                .ready
                .wait_timeout(slot, wait)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|e| e.into_inner().0);
        }
    }
}
