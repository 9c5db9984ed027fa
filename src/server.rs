//! Multiplexed TCP server.
//!
//! One thread runs the event loop: listener readiness accepts every
//! pending connection, connection readiness performs one bounded receive
//! and one bounded send. Per-connection failures close only that
//! connection; a failing multiplexer stops the loop.

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::runtime::{
    Connection, Disposition, EventLoop, Listener, ProcessResult, Protocol, ReadOutcome, Ready,
    ReadyKind, ShutdownHandle, Slot,
};
use mio::net::TcpStream;
use mio::{Interest, Token};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// State of the listening socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListenState {
    Unbound,
    Bound { token: Token, addr: SocketAddr },
}

/// Server instance
pub struct Server {
    event_loop: EventLoop<Connection<TcpStream>>,
    listener: ListenState,
    protocol: Protocol,
    read_size: usize,
}

impl Server {
    /// Bind the listening socket and register it with a fresh event loop.
    ///
    /// Fails with [`ServerError::Bind`] before any event is processed if the
    /// address is in use or not local.
    pub fn bind(config: &ServerConfig) -> Result<Self, ServerError> {
        let mut event_loop = EventLoop::new(config.events)?;
        let listener = Listener::bind(config.listen, config.backlog)?;
        let addr = listener.local_addr();
        let token = event_loop.register_listener(listener)?;

        info!(
            addr = %addr,
            backlog = config.backlog,
            protocol = ?config.protocol,
            "Server listening"
        );

        Ok(Server {
            event_loop,
            listener: ListenState::Bound { token, addr },
            protocol: config.protocol,
            read_size: config.read_size,
        })
    }

    /// Address the server is listening on, if still bound.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self.listener {
            ListenState::Bound { addr, .. } => Some(addr),
            ListenState::Unbound => None,
        }
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.event_loop.shutdown_handle()
    }

    /// Number of open client connections.
    pub fn connection_count(&self) -> usize {
        self.event_loop.peer_tokens().len()
    }

    /// Serve until shutdown is requested or the multiplexer fails.
    ///
    /// The listener and every open connection are closed before returning,
    /// whatever the outcome.
    pub fn run(&mut self) -> Result<(), ServerError> {
        let result = self.serve();
        if let Err(ref e) = result {
            warn!(error = %e, "Server encountered an error");
        }
        self.close();
        result
    }

    fn serve(&mut self) -> Result<(), ServerError> {
        while !self.event_loop.is_shutdown() {
            self.run_once(None)?;
        }
        info!("Shutdown requested");
        Ok(())
    }

    /// Wait for one batch of readiness events and dispatch it.
    ///
    /// Returns the number of events handled.
    pub fn run_once(&mut self, timeout: Option<Duration>) -> Result<usize, ServerError> {
        let ready = self.event_loop.poll(timeout).map_err(ServerError::Poll)?;

        for event in &ready {
            match event.kind {
                ReadyKind::Wake => trace!("Woken"),
                ReadyKind::Listener => self.accept_connections(event.token),
                ReadyKind::Peer => self.handle_connection_event(*event),
            }
        }

        Ok(ready.len())
    }

    /// Accept until the queue is drained.
    fn accept_connections(&mut self, token: Token) {
        loop {
            let accepted = match self.event_loop.listener(token) {
                Some(listener) => listener.accept(),
                None => return,
            };

            match accepted {
                Ok(Some((stream, peer))) => {
                    let conn = Connection::new(stream, peer, self.read_size);
                    match self
                        .event_loop
                        .register(conn, Interest::READABLE | Interest::WRITABLE)
                    {
                        Ok(conn_token) => {
                            info!(peer = %peer, token = conn_token.0, "Received connection")
                        }
                        Err(e) => warn!(peer = %peer, error = %e, "Failed to register connection"),
                    }
                }
                Ok(None) => return,
                Err(e) => {
                    warn!(error = %e, "Accept error");
                    return;
                }
            }
        }
    }

    fn handle_connection_event(&mut self, event: Ready) {
        let protocol = self.protocol;
        let Some(conn) = self.event_loop.get_mut(event.token) else {
            return;
        };

        let peer = conn.peer();
        let disposition = match drive_connection(conn, event, protocol) {
            Ok(disposition) => disposition,
            Err(e) => {
                debug!(peer = %peer, error = %e, "Connection error");
                Disposition::Close("I/O error")
            }
        };

        match disposition {
            Disposition::KeepOpen => {
                let interest = conn.desired_interest();
                if let Err(e) = self.event_loop.modify(event.token, interest) {
                    debug!(peer = %peer, error = %e, "Failed to re-arm connection");
                    self.close_connection(event.token, "re-arm failed");
                }
            }
            Disposition::Close(reason) => self.close_connection(event.token, reason),
        }
    }

    fn close_connection(&mut self, token: Token, reason: &str) {
        if let Some(Slot::Peer(conn)) = self.event_loop.unregister(token) {
            info!(peer = %conn.peer(), token = token.0, reason, "Terminating connection");
        }
    }

    /// Close the listener and every open connection.
    ///
    /// Safe to call more than once; only the first call does anything.
    pub fn close(&mut self) {
        if let ListenState::Bound { token, addr } = self.listener {
            self.listener = ListenState::Unbound;
            self.event_loop.unregister(token);
            info!(addr = %addr, "Stopping the server");
        }

        for token in self.event_loop.peer_tokens() {
            self.close_connection(token, "server stopped");
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.close();
    }
}

/// Handle one readiness event for a connection: read first, then write.
fn drive_connection(
    conn: &mut Connection<TcpStream>,
    event: Ready,
    protocol: Protocol,
) -> io::Result<Disposition> {
    if event.readable {
        match conn.receive()? {
            ReadOutcome::Eof => return Ok(Disposition::Close("peer closed")),
            ReadOutcome::WouldBlock => {}
            ReadOutcome::Data(n) => {
                trace!(peer = %conn.peer(), bytes = n, "Received");
                if let ProcessResult::Response {
                    consumed,
                    response_len,
                } = conn.respond(protocol)
                {
                    trace!(peer = %conn.peer(), consumed, response_len, "Queued response");
                }
            }
        }
    }

    if event.writable {
        let sent = conn.send()?;
        if sent > 0 {
            trace!(peer = %conn.peer(), bytes = sent, "Sent");
        }
    }

    Ok(Disposition::KeepOpen)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::HELLO_RESPONSE;
    use std::io::{Read, Write};
    use std::thread;
    use std::time::Instant;

    fn test_config(protocol: Protocol) -> ServerConfig {
        ServerConfig {
            listen: "127.0.0.1:0".parse().unwrap(),
            protocol,
            ..ServerConfig::default()
        }
    }

    fn spawn_server(
        protocol: Protocol,
    ) -> (
        SocketAddr,
        ShutdownHandle,
        thread::JoinHandle<Result<(), ServerError>>,
    ) {
        let mut server = Server::bind(&test_config(protocol)).unwrap();
        let addr = server.local_addr().unwrap();
        let handle = server.shutdown_handle();
        let runner = thread::spawn(move || server.run());
        (addr, handle, runner)
    }

    fn connect(addr: SocketAddr) -> std::net::TcpStream {
        let stream = std::net::TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
    }

    /// Drive the server on this thread until `done` holds.
    fn turn_until(server: &mut Server, done: impl Fn(&Server) -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done(server) {
            assert!(Instant::now() < deadline, "timed out driving server");
            server.run_once(Some(Duration::from_millis(20))).unwrap();
        }
    }

    #[test]
    fn test_hello_world_response() {
        let (addr, handle, runner) = spawn_server(Protocol::HelloWorld);

        let mut client = connect(addr);
        client.write_all(b"GET / HTTP/1.0\r\n\r\n").unwrap();
        let mut response = vec![0u8; HELLO_RESPONSE.len()];
        client.read_exact(&mut response).unwrap();

        assert_eq!(response, HELLO_RESPONSE);

        handle.trigger();
        runner.join().unwrap().unwrap();
    }

    #[test]
    fn test_many_clients_all_served() {
        let (addr, handle, runner) = spawn_server(Protocol::HelloWorld);

        let mut clients: Vec<_> = (0..64).map(|_| connect(addr)).collect();
        for (i, client) in clients.iter_mut().enumerate().rev() {
            client.write_all(format!("request {i}").as_bytes()).unwrap();
        }
        for client in &mut clients {
            let mut response = vec![0u8; HELLO_RESPONSE.len()];
            client.read_exact(&mut response).unwrap();
            assert_eq!(response, HELLO_RESPONSE);
        }

        handle.trigger();
        runner.join().unwrap().unwrap();
    }

    #[test]
    fn test_echo_split_request() {
        let (addr, handle, runner) = spawn_server(Protocol::Echo);

        let mut client = connect(addr);
        client.write_all(b"Mess").unwrap();
        thread::sleep(Duration::from_millis(20));
        client.write_all(b"age 1").unwrap();
        thread::sleep(Duration::from_millis(20));
        client.write_all(b"Message 2").unwrap();

        let mut response = vec![0u8; 18];
        client.read_exact(&mut response).unwrap();
        assert_eq!(response, b"Message 1Message 2");

        handle.trigger();
        runner.join().unwrap().unwrap();
    }

    #[test]
    fn test_echo_large_payload_survives_backpressure() {
        let (addr, handle, runner) = spawn_server(Protocol::Echo);

        let payload: Vec<u8> = (0..4 * 1024 * 1024u32).map(|i| (i % 251) as u8).collect();
        let mut client = connect(addr);
        let mut writer = client.try_clone().unwrap();
        let to_send = payload.clone();
        let sender = thread::spawn(move || writer.write_all(&to_send).unwrap());

        let mut echoed = vec![0u8; payload.len()];
        client.read_exact(&mut echoed).unwrap();
        sender.join().unwrap();

        assert!(echoed == payload, "echoed bytes differ from payload");

        handle.trigger();
        runner.join().unwrap().unwrap();
    }

    #[test]
    fn test_peer_close_releases_connection() {
        let mut server = Server::bind(&test_config(Protocol::Echo)).unwrap();
        let addr = server.local_addr().unwrap();

        let mut client = connect(addr);
        turn_until(&mut server, |s| s.connection_count() == 1);

        client.write_all(b"bye").unwrap();
        drop(client);
        turn_until(&mut server, |s| s.connection_count() == 0);

        // Listener keeps working after a connection goes away.
        let _next = connect(addr);
        turn_until(&mut server, |s| s.connection_count() == 1);
    }

    #[test]
    fn test_reset_peer_closes_only_that_connection() {
        let mut server = Server::bind(&test_config(Protocol::Echo)).unwrap();
        let addr = server.local_addr().unwrap();

        let reset = connect(addr);
        let mut survivor = connect(addr);
        turn_until(&mut server, |s| s.connection_count() == 2);

        // Linger zero turns the close into a RST, so the server's next
        // receive fails instead of reporting EOF.
        let reset = socket2::Socket::from(reset);
        reset.set_linger(Some(Duration::ZERO)).unwrap();
        drop(reset);
        turn_until(&mut server, |s| s.connection_count() == 1);

        survivor.write_all(b"still here").unwrap();
        survivor.set_nonblocking(true).unwrap();
        let mut echoed = vec![0u8; 10];
        let mut got = 0;
        let deadline = Instant::now() + Duration::from_secs(5);
        while got < echoed.len() {
            assert!(Instant::now() < deadline, "timed out waiting for echo");
            server.run_once(Some(Duration::from_millis(20))).unwrap();
            match survivor.read(&mut echoed[got..]) {
                Ok(0) => panic!("survivor was closed"),
                Ok(n) => got += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => panic!("read failed: {e}"),
            }
        }

        assert_eq!(echoed, b"still here");
        assert_eq!(server.connection_count(), 1);
    }

    #[test]
    fn test_bind_conflict_fails_before_loop() {
        let server = Server::bind(&test_config(Protocol::HelloWorld)).unwrap();
        let addr = server.local_addr().unwrap();

        let config = ServerConfig {
            listen: addr,
            ..ServerConfig::default()
        };
        match Server::bind(&config) {
            Err(ServerError::Bind { addr: failed, .. }) => assert_eq!(failed, addr),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("second bind succeeded"),
        }
    }

    #[test]
    fn test_shutdown_allows_immediate_rebind() {
        let (addr, handle, runner) = spawn_server(Protocol::HelloWorld);

        let mut client = connect(addr);
        client.write_all(b"hi").unwrap();
        let mut response = vec![0u8; HELLO_RESPONSE.len()];
        client.read_exact(&mut response).unwrap();

        handle.trigger();
        runner.join().unwrap().unwrap();

        // Server side closed the connection on shutdown.
        let mut rest = Vec::new();
        assert_eq!(client.read_to_end(&mut rest).unwrap(), 0);

        let config = ServerConfig {
            listen: addr,
            ..ServerConfig::default()
        };
        let rebound = Server::bind(&config).unwrap();
        assert_eq!(rebound.local_addr(), Some(addr));
    }

    #[test]
    fn test_close_is_idempotent() {
        let mut server = Server::bind(&test_config(Protocol::HelloWorld)).unwrap();
        let addr = server.local_addr().unwrap();

        let _client = connect(addr);
        turn_until(&mut server, |s| s.connection_count() == 1);

        server.close();
        assert_eq!(server.local_addr(), None);
        assert_eq!(server.connection_count(), 0);

        server.close();
        assert_eq!(server.local_addr(), None);
    }
}
