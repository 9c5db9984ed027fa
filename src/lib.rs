//! selector-server: a readiness-multiplexed TCP server
//!
//! One thread multiplexes every client connection over a single mio poll:
//! - Listener readiness accepts all pending connections
//! - Connection readiness performs one bounded receive and one bounded send
//! - Partial sends keep the unsent tail buffered for the next tick
//!
//! Request handlers:
//! - Hello world: fixed `HTTP/1.0 200 OK` response to any request
//! - Echo: every received byte is sent back in order
//!
//! A matching client driver opens many connections and sends each a queue
//! of messages over the same kind of event loop.

pub mod client;
pub mod config;
pub mod error;
pub mod runtime;
pub mod server;
#[cfg(unix)]
pub mod signal;

pub use client::{ClientDriver, ConnState, Transcript};
pub use config::{ClientConfig, ConfigError, ServerConfig};
pub use error::ServerError;
pub use server::Server;
