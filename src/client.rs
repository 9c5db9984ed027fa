//! Multi-connection client driver.
//!
//! Opens several non-blocking connections to one server and feeds each a
//! FIFO queue of messages. A message is moved into a connection's outbound
//! buffer only once the previous one has been fully sent.
//!
//! Connection lifecycle: `Connecting -> Active -> Closed`. A connection
//! closes when the server closes it, on an I/O error, or, if an expected
//! response size is configured, once that many bytes have arrived and
//! nothing is left to send.

use crate::config::ClientConfig;
use crate::error::ServerError;
use crate::runtime::{
    Connection, Disposition, EventLoop, ReadOutcome, Ready, ReadyKind, ShutdownHandle, Slot,
};
use bytes::{Bytes, BytesMut};
use mio::event::Source;
use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use tracing::{debug, info, trace, warn};

/// Client connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Connecting,
    Active,
    Closed,
}

/// What one connection sent and received.
#[derive(Debug, Clone)]
pub struct Transcript {
    /// 1-based connection number.
    pub id: usize,
    pub received: Bytes,
    /// Whether every queued message was written before closing.
    pub all_sent: bool,
    pub state: ConnState,
}

struct ClientConnection {
    id: usize,
    conn: Connection<TcpStream>,
    state: ConnState,
    queue: VecDeque<Bytes>,
    received: BytesMut,
}

impl ClientConnection {
    fn desired_interest(&self) -> Interest {
        if self.state == ConnState::Connecting
            || self.conn.has_pending_output()
            || !self.queue.is_empty()
        {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        }
    }

    fn is_drained(&self) -> bool {
        self.queue.is_empty() && !self.conn.has_pending_output()
    }

    /// Confirm a non-blocking connect once the socket reports readiness.
    ///
    /// Returns `false` while the handshake is still in flight.
    fn finish_connect(&mut self) -> io::Result<bool> {
        let stream = self.conn.stream();
        if let Some(e) = stream.take_error()? {
            return Err(e);
        }
        match stream.peer_addr() {
            Ok(_) => {
                self.state = ConnState::Active;
                Ok(true)
            }
            Err(ref e) if e.kind() == io::ErrorKind::NotConnected => Ok(false),
            Err(e) => Err(e),
        }
    }
}

impl Source for ClientConnection {
    fn register(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        self.conn.register(registry, token, interests)
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        self.conn.reregister(registry, token, interests)
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        self.conn.deregister(registry)
    }
}

/// Drives many client connections over one event loop.
pub struct ClientDriver {
    event_loop: EventLoop<ClientConnection>,
    server: SocketAddr,
    expect_bytes: Option<usize>,
    transcripts: Vec<Transcript>,
}

impl ClientDriver {
    /// Start `config.connections` non-blocking connects to `config.server`.
    ///
    /// A connection that fails to start is logged and recorded as closed;
    /// the others proceed.
    pub fn connect(config: &ClientConfig) -> Result<Self, ServerError> {
        let mut event_loop = EventLoop::new(config.events)?;
        let messages: Vec<Bytes> = config
            .messages
            .iter()
            .map(|m| Bytes::copy_from_slice(m.as_bytes()))
            .collect();

        let mut transcripts = Vec::new();
        for id in 1..=config.connections {
            info!(connection = id, server = %config.server, "Connecting");
            let opened = TcpStream::connect(config.server).and_then(|stream| {
                let client = ClientConnection {
                    id,
                    conn: Connection::new(stream, config.server, config.read_size),
                    state: ConnState::Connecting,
                    queue: messages.iter().cloned().collect(),
                    received: BytesMut::new(),
                };
                event_loop.register(client, Interest::READABLE | Interest::WRITABLE)
            });

            if let Err(e) = opened {
                warn!(connection = id, server = %config.server, error = %e, "Failed to connect");
                transcripts.push(Transcript {
                    id,
                    received: Bytes::new(),
                    all_sent: messages.is_empty(),
                    state: ConnState::Closed,
                });
            }
        }

        Ok(ClientDriver {
            event_loop,
            server: config.server,
            expect_bytes: config.expect_bytes,
            transcripts,
        })
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.event_loop.shutdown_handle()
    }

    /// Number of connections not yet closed.
    pub fn open_connections(&self) -> usize {
        self.event_loop.len()
    }

    /// Run until every connection is closed or shutdown is requested.
    ///
    /// Connections still open when the loop stops, for any reason, are
    /// closed before this returns. Transcripts are ordered by connection id.
    pub fn run(&mut self) -> Result<Vec<Transcript>, ServerError> {
        let result = self.drive();
        self.close_all("driver stopped");

        let mut transcripts = std::mem::take(&mut self.transcripts);
        transcripts.sort_by_key(|t| t.id);
        result.map(|_| transcripts)
    }

    fn drive(&mut self) -> Result<(), ServerError> {
        while !self.event_loop.is_empty() && !self.event_loop.is_shutdown() {
            let ready = self.event_loop.poll(None).map_err(ServerError::Poll)?;
            for event in ready {
                if event.kind == ReadyKind::Peer {
                    self.handle_event(event);
                }
            }
        }
        Ok(())
    }

    fn handle_event(&mut self, event: Ready) {
        let expect_bytes = self.expect_bytes;
        let Some(client) = self.event_loop.get_mut(event.token) else {
            return;
        };

        let id = client.id;
        let disposition = match drive_client(client, event, expect_bytes) {
            Ok(disposition) => disposition,
            Err(e) => {
                warn!(connection = id, server = %self.server, error = %e, "Connection error");
                Disposition::Close("I/O error")
            }
        };

        match disposition {
            Disposition::KeepOpen => {
                let interest = client.desired_interest();
                if let Err(e) = self.event_loop.modify(event.token, interest) {
                    debug!(connection = id, error = %e, "Failed to re-arm connection");
                    self.close_connection(event.token, "re-arm failed");
                }
            }
            Disposition::Close(reason) => self.close_connection(event.token, reason),
        }
    }

    /// Unregister and close one connection, recording its transcript.
    fn close_connection(&mut self, token: Token, reason: &str) {
        if let Some(Slot::Peer(mut client)) = self.event_loop.unregister(token) {
            client.state = ConnState::Closed;
            info!(connection = client.id, reason, "Closing connection");
            self.transcripts.push(Transcript {
                id: client.id,
                all_sent: client.is_drained(),
                received: client.received.freeze(),
                state: client.state,
            });
        }
    }

    fn close_all(&mut self, reason: &str) {
        for token in self.event_loop.peer_tokens() {
            self.close_connection(token, reason);
        }
    }
}

impl Drop for ClientDriver {
    fn drop(&mut self) {
        self.close_all("driver dropped");
    }
}

fn drive_client(
    client: &mut ClientConnection,
    event: Ready,
    expect_bytes: Option<usize>,
) -> io::Result<Disposition> {
    if client.state == ConnState::Connecting {
        if !client.finish_connect()? {
            return Ok(Disposition::KeepOpen);
        }
        info!(connection = client.id, peer = %client.conn.peer(), "Connected");
    }

    if event.readable {
        match client.conn.receive()? {
            ReadOutcome::Eof => return Ok(Disposition::Close("server closed")),
            ReadOutcome::WouldBlock => {}
            ReadOutcome::Data(_) => {
                let data = client.conn.take_inbound();
                info!(
                    connection = client.id,
                    message = %String::from_utf8_lossy(&data),
                    "Received message"
                );
                client.received.extend_from_slice(&data);
            }
        }
    }

    if event.writable {
        if !client.conn.has_pending_output() {
            if let Some(message) = client.queue.pop_front() {
                debug!(
                    connection = client.id,
                    message = %String::from_utf8_lossy(&message),
                    "Sending"
                );
                client.conn.enqueue(&message);
            }
        }
        let sent = client.conn.send()?;
        if sent > 0 {
            trace!(connection = client.id, bytes = sent, "Sent");
        }
    }

    if let Some(expected) = expect_bytes {
        if client.received.len() >= expected && client.is_drained() {
            return Ok(Disposition::Close("response complete"));
        }
    }

    Ok(Disposition::KeepOpen)
}
