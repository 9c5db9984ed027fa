//! Non-blocking listening socket.

use crate::error::ServerError;
use mio::event::Source;
use mio::net::{TcpListener, TcpStream};
use mio::{Interest, Registry, Token};
use std::io;
use std::net::SocketAddr;

/// Default pending-connection queue length.
pub const DEFAULT_BACKLOG: i32 = 1024;

/// A bound, listening, non-blocking TCP socket.
#[derive(Debug)]
pub struct Listener {
    inner: TcpListener,
    local_addr: SocketAddr,
}

impl Listener {
    /// Bind and listen on `addr`.
    ///
    /// `SO_REUSEADDR` is set before binding so a restart does not trip over
    /// sockets in `TIME_WAIT`. `SO_REUSEPORT` is not set, so binding an
    /// address that is already listening fails.
    pub fn bind(addr: SocketAddr, backlog: i32) -> Result<Self, ServerError> {
        let listener = create_listener(addr, backlog).map_err(|source| ServerError::Bind {
            addr,
            source,
        })?;
        let inner = TcpListener::from_std(listener);
        let local_addr = inner.local_addr().map_err(ServerError::Io)?;

        Ok(Self { inner, local_addr })
    }

    /// Accept one pending connection.
    ///
    /// Returns `Ok(None)` once the accept queue is drained.
    pub fn accept(&self) -> io::Result<Option<(TcpStream, SocketAddr)>> {
        loop {
            match self.inner.accept() {
                Ok(accepted) => return Ok(Some(accepted)),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Source for Listener {
    fn register(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        self.inner.register(registry, token, interests)
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        self.inner.reregister(registry, token, interests)
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        self.inner.deregister(registry)
    }
}

fn create_listener(addr: SocketAddr, backlog: i32) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn any_port() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[test]
    fn test_bind_reports_local_addr() {
        let listener = Listener::bind(any_port(), DEFAULT_BACKLOG).unwrap();
        assert_ne!(listener.local_addr().port(), 0);
    }

    #[test]
    fn test_rebind_while_bound_fails() {
        let first = Listener::bind(any_port(), DEFAULT_BACKLOG).unwrap();

        let err = Listener::bind(first.local_addr(), DEFAULT_BACKLOG).unwrap_err();
        match err {
            ServerError::Bind { addr, source } => {
                assert_eq!(addr, first.local_addr());
                assert_eq!(source.kind(), io::ErrorKind::AddrInUse);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_rebind_after_drop_succeeds() {
        let first = Listener::bind(any_port(), DEFAULT_BACKLOG).unwrap();
        let addr = first.local_addr();
        drop(first);

        let second = Listener::bind(addr, DEFAULT_BACKLOG).unwrap();
        assert_eq!(second.local_addr(), addr);
    }

    #[test]
    fn test_accept_drains_to_none() {
        let listener = Listener::bind(any_port(), DEFAULT_BACKLOG).unwrap();
        assert!(listener.accept().unwrap().is_none());

        let _a = std::net::TcpStream::connect(listener.local_addr()).unwrap();
        let _b = std::net::TcpStream::connect(listener.local_addr()).unwrap();

        let mut accepted = 0;
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while accepted < 2 && std::time::Instant::now() < deadline {
            while let Some((_stream, peer)) = listener.accept().unwrap() {
                assert!(peer.ip().is_loopback());
                accepted += 1;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }

        assert_eq!(accepted, 2);
        assert!(listener.accept().unwrap().is_none());
    }
}
