//! Server error types.

use std::fmt;
use std::io;
use std::net::SocketAddr;

/// Errors that stop a server or client driver.
///
/// Per-connection failures never show up here: they close the affected
/// connection and the loop keeps running.
#[derive(Debug)]
pub enum ServerError {
    /// Listening socket could not be bound (address in use, not local, ...).
    Bind { addr: SocketAddr, source: io::Error },
    /// The readiness multiplexer itself failed.
    Poll(io::Error),
    /// Any other setup or registration failure.
    Io(io::Error),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerError::Bind { addr, source } => {
                write!(f, "failed to bind {}: {}", addr, source)
            }
            ServerError::Poll(e) => write!(f, "event loop failed: {}", e),
            ServerError::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::Bind { source, .. } => Some(source),
            ServerError::Poll(e) | ServerError::Io(e) => Some(e),
        }
    }
}

impl From<io::Error> for ServerError {
    fn from(e: io::Error) -> Self {
        ServerError::Io(e)
    }
}
