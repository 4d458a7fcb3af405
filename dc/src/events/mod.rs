//! Outbound events
//!
//! The session talks to the peer exclusively through [`OutboundEvent`]s:
//!
//! ```text
//!  Orchestrator ─┐
//!  Broker ───────┼──► EventSink ──► (unbounded mpsc) ──► writer task ──► peer
//!  Pipe ─────────┘                                         │
//!                                                          └──► TranscriptLogger (optional)
//! ```
//!
//! A single channel means a single order: whatever was emitted first reaches
//! the peer first, no matter which thread emitted it.

mod logger;
mod sink;
mod types;

pub use logger::TranscriptLogger;
pub use sink::EventSink;
pub use types::{LISTEN_TO, LogLevel, OutboundEvent, ResponsePayload, TranscriptEntry};
