//! Readiness-based runtime shared by the server and the client driver.
//!
//! - `EventLoop`: mio poll plus a slab registry of tagged slots
//! - `Listener`: non-blocking listening socket
//! - `Connection`: per-connection inbound/outbound buffering
//! - `Protocol`: request handlers producing outbound bytes

mod connection;
mod event_loop;
mod listener;
mod protocol;

pub use connection::{Connection, Disposition, ReadOutcome, DEFAULT_READ_SIZE};
pub use event_loop::{EventLoop, Ready, ReadyKind, ShutdownHandle, Slot, WAKE_TOKEN};
pub use listener::{Listener, DEFAULT_BACKLOG};
pub use protocol::{ProcessResult, Protocol, HELLO_RESPONSE};
