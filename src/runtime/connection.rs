//! Per-connection byte buffering.
//!
//! A connection owns its stream plus an inbound and an outbound buffer.
//! Every readiness tick performs at most one bounded receive and one
//! bounded send; partial sends leave the unsent tail at the front of the
//! outbound buffer for the next tick.

use crate::runtime::protocol::{ProcessResult, Protocol};
use bytes::{Buf, BytesMut};
use mio::event::Source;
use mio::{Interest, Registry, Token};
use std::io::{self, Read, Write};
use std::net::SocketAddr;

/// Default size of a single receive.
pub const DEFAULT_READ_SIZE: usize = 1024;

/// Outcome of one bounded receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Bytes were appended to the inbound buffer.
    Data(usize),
    /// Nothing to read right now.
    WouldBlock,
    /// Peer closed its write side.
    Eof,
}

/// What the loop should do with a connection after handling its event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    KeepOpen,
    /// Unregister and close; the reason is logged.
    Close(&'static str),
}

/// A single peer connection.
#[derive(Debug)]
pub struct Connection<S> {
    stream: S,
    peer: SocketAddr,
    inbound: BytesMut,
    outbound: BytesMut,
    read_size: usize,
}

impl<S: Read + Write> Connection<S> {
    /// Wrap a freshly accepted or connected stream.
    ///
    /// Starts with empty buffers.
    pub fn new(stream: S, peer: SocketAddr, read_size: usize) -> Self {
        Self {
            stream,
            peer,
            inbound: BytesMut::with_capacity(read_size),
            outbound: BytesMut::new(),
            read_size: read_size.max(1),
        }
    }

    /// Perform one receive of at most `read_size` bytes into the inbound buffer.
    ///
    /// Errors other than `WouldBlock` and `Interrupted` are returned to the
    /// caller, which treats them like EOF.
    pub fn receive(&mut self) -> io::Result<ReadOutcome> {
        let start = self.inbound.len();
        self.inbound.resize(start + self.read_size, 0);

        let result = self.stream.read(&mut self.inbound[start..]);
        let n = match result {
            Ok(n) => n,
            Err(_) => 0,
        };
        self.inbound.truncate(start + n);

        match result {
            Ok(0) => Ok(ReadOutcome::Eof),
            Ok(n) => Ok(ReadOutcome::Data(n)),
            Err(ref e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::Interrupted =>
            {
                Ok(ReadOutcome::WouldBlock)
            }
            Err(e) => Err(e),
        }
    }

    /// Perform one send of the outbound buffer.
    ///
    /// Removes exactly the bytes the kernel accepted and returns their count.
    /// Returns `Ok(0)` if there was nothing to send or the send would block.
    pub fn send(&mut self) -> io::Result<usize> {
        if self.outbound.is_empty() {
            return Ok(0);
        }

        match self.stream.write(&self.outbound) {
            Ok(0) => Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0")),
            Ok(n) => {
                self.outbound.advance(n);
                Ok(n)
            }
            Err(ref e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::Interrupted =>
            {
                Ok(0)
            }
            Err(e) => Err(e),
        }
    }
}

impl<S> Connection<S> {
    /// Run `protocol` over the inbound buffer, appending its response to
    /// the outbound buffer.
    pub fn respond(&mut self, protocol: Protocol) -> ProcessResult {
        protocol.process(&mut self.inbound, &mut self.outbound)
    }

    /// Append raw bytes to the outbound buffer.
    pub fn enqueue(&mut self, data: &[u8]) {
        self.outbound.extend_from_slice(data);
    }

    /// Take everything received so far, leaving the inbound buffer empty.
    pub fn take_inbound(&mut self) -> BytesMut {
        self.inbound.split()
    }

    pub fn inbound(&self) -> &[u8] {
        &self.inbound
    }

    pub fn outbound(&self) -> &[u8] {
        &self.outbound
    }

    pub fn has_pending_output(&self) -> bool {
        !self.outbound.is_empty()
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn stream(&self) -> &S {
        &self.stream
    }

    /// Interest this connection needs for its next tick: always readable,
    /// writable only while output is pending.
    pub fn desired_interest(&self) -> Interest {
        if self.outbound.is_empty() {
            Interest::READABLE
        } else {
            Interest::READABLE | Interest::WRITABLE
        }
    }
}

impl<S: Source> Source for Connection<S> {
    fn register(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        self.stream.register(registry, token, interests)
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        self.stream.reregister(registry, token, interests)
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        self.stream.deregister(registry)
    }
}
