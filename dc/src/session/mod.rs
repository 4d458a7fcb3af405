//! Session orchestration
//!
//! One session per connected process. The pieces, leaves first:
//!
//! - [`CorrelationRegister`] - single-slot answer store
//! - [`ConfirmationBroker`] - the engine's blocking `confirm_ask`, plus
//!   tool output routing and command-output tracking
//! - [`StreamingPipe`] - drains an engine's chunk source into `response`
//!   events
//! - [`Orchestrator`] - prompt lifecycle, sub-executions, reflections and
//!   every other inbound action
//!
//! Engine calls block, so they all run on `spawn_blocking` threads. The
//! gateway reader never waits on any of them: answers and interrupts land on
//! [`SessionShared`] directly.

mod broker;
mod mergeback;
mod orchestrator;
mod pipe;
mod register;
mod state;
mod sync;
#[cfg(test)]
pub(crate) mod testing;

use thiserror::Error;

use crate::engine::EngineError;

pub use broker::{BrokerSettings, ConfirmationBroker, is_affirmative};
pub use orchestrator::Orchestrator;
pub use pipe::{PipeOutcome, StreamingPipe};
pub use register::{CorrelationRegister, TakeError};
pub use state::{CommandTracking, ExecutionHandle, SessionShared};
pub use sync::{ModelOverrides, PeerSync, PeerView};

/// Failures while handling an inbound action
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("{0}")]
    Engine(#[from] EngineError),

    #[error("Blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("Peer connection closed")]
    SinkClosed,
}
