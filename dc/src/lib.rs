//! DeskConnector - session orchestrator for a desktop peer
//!
//! Sits between one duplex connection to a remote peer and a stateful agent
//! engine. Each prompt the peer sends is streamed back chunk by chunk; the
//! engine can stop mid-run to ask the peer a question, the peer can interrupt
//! at any point, and runs may spawn a differently-configured sub-execution or
//! a bounded chain of follow-up reflections.
//!
//! # Modules
//!
//! - [`gateway`] - transport and the per-connection dispatch loop
//! - [`session`] - orchestrator, confirmation broker and streaming pipe
//! - [`engine`] - the engine interface and the LLM-backed engine
//! - [`events`] - outbound event vocabulary, sink and transcript
//! - [`llm`] - streaming LLM clients
//! - [`config`] - configuration types and loading
//! - [`cli`] - command-line interface

pub mod cli;
pub mod config;
pub mod engine;
pub mod events;
pub mod gateway;
pub mod llm;
pub mod session;

pub use config::{Config, EngineConfig, LlmConfig, ServerConfig, SessionConfig};
pub use engine::{
    ChunkSource, Engine, EngineError, EngineFactory, EngineIo, EngineSpec, LlmEngine, LlmEngineFactory, ModelCatalog,
    Question, QuestionKind,
};
pub use events::{EventSink, OutboundEvent, ResponsePayload, TranscriptLogger};
pub use gateway::{Endpoint, InboundAction, ProtocolError, ServeOptions, parse_inbound, serve};
pub use llm::{LlmClient, LlmError, create_client};
pub use session::{ConfirmationBroker, CorrelationRegister, Orchestrator, SessionError, SessionShared, StreamingPipe};
