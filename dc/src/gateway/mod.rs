//! Connection gateway
//!
//! Owns the duplex channel to the peer: newline-delimited JSON in both
//! directions over TCP or a Unix socket.

mod connection;
mod messages;
mod transport;

pub use connection::{ServeOptions, serve};
pub use messages::{InboundAction, ProtocolError, parse_inbound};
pub use transport::{BoxedReader, BoxedWriter, DEFAULT_PORT, Endpoint, backoff_delay, connect, connect_with_retry};
