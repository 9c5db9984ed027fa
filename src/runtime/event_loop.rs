//! mio-backed readiness multiplexer.
//!
//! Readiness-based model: poll tells us when sockets are ready,
//! then the owner performs non-blocking read/write syscalls.
//! Uses epoll on Linux, kqueue on macOS.
//!
//! ## Registry
//!
//! Every registered descriptor owns exactly one slab entry holding its
//! current interest and a tagged [`Slot`]: either the listening socket or
//! per-connection state. Dispatch matches on that tag.
//!
//! ## Level-triggered emulation
//!
//! mio readiness is edge-triggered. Owners call [`EventLoop::modify`] after
//! handling each event; re-arming makes the backend re-check the descriptor,
//! so readiness that is still present is reported again on the next poll.

use crate::runtime::listener::Listener;
use mio::event::Source;
use mio::{Events, Interest, Poll, Token, Waker};
use slab::Slab;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// Reserved token for the shutdown waker.
pub const WAKE_TOKEN: Token = Token(usize::MAX);

/// Registry payload: the listener never carries connection state.
#[derive(Debug)]
pub enum Slot<T> {
    Listener(Listener),
    Peer(T),
}

/// Tag copied from the registry into each ready event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyKind {
    /// Shutdown was requested through a [`ShutdownHandle`].
    Wake,
    Listener,
    Peer,
}

/// One readiness notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ready {
    pub token: Token,
    pub kind: ReadyKind,
    pub readable: bool,
    pub writable: bool,
}

#[derive(Debug)]
struct Entry<T> {
    interest: Interest,
    slot: Slot<T>,
}

impl<T: Source> Entry<T> {
    fn source_mut(&mut self) -> &mut dyn Source {
        match &mut self.slot {
            Slot::Listener(listener) => listener as &mut dyn Source,
            Slot::Peer(state) => state as &mut dyn Source,
        }
    }
}

/// Cloneable handle that asks a running loop to stop.
///
/// Safe to trigger from another thread or from a signal handler: it only
/// stores an atomic flag and writes to the waker.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    requested: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl ShutdownHandle {
    pub fn trigger(&self) {
        self.requested.store(true, Ordering::SeqCst);
        let _ = self.waker.wake();
    }

    pub fn is_triggered(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }
}

/// Single-threaded readiness loop over a slab registry.
pub struct EventLoop<T> {
    poll: Poll,
    events: Events,
    entries: Slab<Entry<T>>,
    shutdown: ShutdownHandle,
}

impl<T: Source> EventLoop<T> {
    /// Create a loop reporting at most `capacity` events per poll.
    pub fn new(capacity: usize) -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN)?;

        Ok(Self {
            poll,
            events: Events::with_capacity(capacity.max(1)),
            entries: Slab::new(),
            shutdown: ShutdownHandle {
                requested: Arc::new(AtomicBool::new(false)),
                waker: Arc::new(waker),
            },
        })
    }

    /// Register the listening socket. Its interest is fixed at readable.
    pub fn register_listener(&mut self, listener: Listener) -> io::Result<Token> {
        self.insert(Slot::Listener(listener), Interest::READABLE)
    }

    /// Register per-connection state with the given interest.
    ///
    /// If registration fails the state is dropped, closing its descriptor.
    pub fn register(&mut self, state: T, interest: Interest) -> io::Result<Token> {
        self.insert(Slot::Peer(state), interest)
    }

    fn insert(&mut self, slot: Slot<T>, interest: Interest) -> io::Result<Token> {
        let vacant = self.entries.vacant_entry();
        let token = Token(vacant.key());
        debug_assert_ne!(token, WAKE_TOKEN);

        let mut entry = Entry { interest, slot };
        entry
            .source_mut()
            .register(self.poll.registry(), token, interest)?;
        vacant.insert(entry);

        trace!(token = token.0, ?interest, "Registered");
        Ok(token)
    }

    /// Change a connection's interest and re-arm it.
    ///
    /// The listener's interest cannot be changed.
    pub fn modify(&mut self, token: Token, interest: Interest) -> io::Result<()> {
        let entry = self
            .entries
            .get_mut(token.0)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "token not registered"))?;

        if matches!(entry.slot, Slot::Listener(_)) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "listener interest is fixed",
            ));
        }

        entry
            .source_mut()
            .reregister(self.poll.registry(), token, interest)?;
        entry.interest = interest;
        Ok(())
    }

    /// Remove a descriptor from the registry and hand back its slot.
    ///
    /// Dropping the returned slot closes the descriptor. Returns `None` if
    /// the token is not registered, so a second call is a no-op.
    pub fn unregister(&mut self, token: Token) -> Option<Slot<T>> {
        let mut entry = self.entries.try_remove(token.0)?;
        if let Err(e) = entry.source_mut().deregister(self.poll.registry()) {
            debug!(token = token.0, error = %e, "Deregister failed");
        }
        trace!(token = token.0, "Unregistered");
        Some(entry.slot)
    }

    /// Unregister every descriptor, listener included.
    pub fn drain(&mut self) -> Vec<(Token, Slot<T>)> {
        let tokens: Vec<Token> = self.entries.iter().map(|(key, _)| Token(key)).collect();
        tokens
            .into_iter()
            .filter_map(|token| self.unregister(token).map(|slot| (token, slot)))
            .collect()
    }

    /// Block until at least one descriptor is ready.
    ///
    /// `Interrupted` is retried internally. Events for descriptors that are
    /// no longer registered are dropped.
    pub fn poll(&mut self, timeout: Option<Duration>) -> io::Result<Vec<Ready>> {
        loop {
            match self.poll.poll(&mut self.events, timeout) {
                Ok(()) => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {
                    if self.shutdown.is_triggered() {
                        return Ok(vec![Ready {
                            token: WAKE_TOKEN,
                            kind: ReadyKind::Wake,
                            readable: false,
                            writable: false,
                        }]);
                    }
                    continue;
                }
                Err(e) => return Err(e),
            }
        }

        let mut ready = Vec::new();
        for event in self.events.iter() {
            let token = event.token();
            let kind = if token == WAKE_TOKEN {
                ReadyKind::Wake
            } else {
                match self.entries.get(token.0) {
                    Some(Entry {
                        slot: Slot::Listener(_),
                        ..
                    }) => ReadyKind::Listener,
                    Some(Entry {
                        slot: Slot::Peer(_),
                        ..
                    }) => ReadyKind::Peer,
                    None => continue,
                }
            };

            ready.push(Ready {
                token,
                kind,
                // Errors and hangups surface through the next receive.
                readable: event.is_readable() || event.is_read_closed() || event.is_error(),
                writable: event.is_writable() || event.is_write_closed(),
            });
        }

        Ok(ready)
    }

    pub fn listener(&self, token: Token) -> Option<&Listener> {
        match self.entries.get(token.0) {
            Some(Entry {
                slot: Slot::Listener(listener),
                ..
            }) => Some(listener),
            _ => None,
        }
    }

    #[cfg(test)]
    pub fn get(&self, token: Token) -> Option<&T> {
        match self.entries.get(token.0) {
            Some(Entry {
                slot: Slot::Peer(state),
                ..
            }) => Some(state),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, token: Token) -> Option<&mut T> {
        match self.entries.get_mut(token.0) {
            Some(Entry {
                slot: Slot::Peer(state),
                ..
            }) => Some(state),
            _ => None,
        }
    }

    /// Interest currently registered for `token`.
    #[cfg(test)]
    pub fn interest(&self, token: Token) -> Option<Interest> {
        self.entries.get(token.0).map(|entry| entry.interest)
    }

    #[cfg(test)]
    pub fn contains(&self, token: Token) -> bool {
        self.entries.contains(token.0)
    }

    /// Number of registered descriptors, listener included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Tokens of all registered connections.
    pub fn peer_tokens(&self) -> Vec<Token> {
        self.entries
            .iter()
            .filter(|(_, entry)| matches!(entry.slot, Slot::Peer(_)))
            .map(|(key, _)| Token(key))
            .collect()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_triggered()
    }
}
