//! Module with the readiness event loop.

use std::io;
use std::{cmp, fmt};

use mio::event::Source;
use mio::{Events, Interest, Poll};

use crate::pool::Handle;

/// Registration token: who a readiness event belongs to.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Token {
    /// The listening socket.
    Listener,
    /// The connection behind the handle.
    Conn(Handle),
}

/// The listener token lives at `usize::MAX`; connection handles can't pack
/// to that value, see [`Handle::into_raw`].
const LISTENER_TOKEN: usize = usize::MAX;

impl From<Token> for mio::Token {
    fn from(token: Token) -> mio::Token {
        match token {
            Token::Listener => mio::Token(LISTENER_TOKEN),
            Token::Conn(handle) => mio::Token(handle.into_raw()),
        }
    }
}

impl From<mio::Token> for Token {
    fn from(token: mio::Token) -> Token {
        if token.0 == LISTENER_TOKEN {
            Token::Listener
        } else {
            Token::Conn(Handle::from_raw(token.0))
        }
    }
}

/// What a registered socket is ready for.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EventKind {
    /// Reading (or accepting) won't block.
    Recv,
    /// Writing won't block.
    Send,
    /// The socket reported an error or hangup without being readable or
    /// writable.
    Failure,
}

/// A single readiness event, see [`EventLoop::wait`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Event {
    /// What the socket is ready for.
    pub kind: EventKind,
    /// Token the socket was registered with.
    pub token: Token,
}

const READY_RECV: u8 = 1 << 0;
const READY_SEND: u8 = 1 << 1;
const READY_FAIL: u8 = 1 << 2;

struct Entry {
    token: Token,
    /// Interests currently registered with the OS; `None` when the entry
    /// has no interests left and is deregistered.
    interests: Option<Interest>,
    /// Readiness reported by the last poll and not yet returned.
    ready: u8,
}

/// Fixed-capacity, readiness-based event loop.
///
/// Every registered socket has an interest set and a [`Token`]. [`wait`]
/// blocks until at least one socket is ready and then yields exactly one
/// event per call: an internal cursor walks the registration table so that
/// all sockets made ready by one poll are drained across successive calls
/// before polling again, which keeps dispatch fair within a poll epoch. A
/// socket that is both readable and writable yields [`EventKind::Recv`]
/// first and [`EventKind::Send`] on the next call.
///
/// [`wait`]: EventLoop::wait
pub struct EventLoop {
    poll: Poll,
    events: Events,
    entries: Vec<Entry>,
    capacity: usize,
    cursor: usize,
}

impl EventLoop {
    /// Create an event loop with room for `capacity` registrations.
    pub fn with_capacity(capacity: usize) -> io::Result<EventLoop> {
        Ok(EventLoop {
            poll: Poll::new()?,
            events: Events::with_capacity(cmp::max(capacity, 8)),
            entries: Vec::with_capacity(capacity),
            capacity,
            cursor: 0,
        })
    }

    /// Returns the number of registered sockets.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if no sockets are registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Register `source` with `interests` under `token`.
    ///
    /// Fails if the registration table is full.
    pub fn add<S: Source>(
        &mut self,
        source: &mut S,
        interests: Interest,
        token: Token,
    ) -> io::Result<()> {
        if self.entries.len() == self.capacity {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "event loop registration table is full",
            ));
        }
        self.poll.registry().register(source, token.into(), interests)?;
        self.entries.push(Entry {
            token,
            interests: Some(interests),
            ready: 0,
        });
        Ok(())
    }

    /// Add `interest` to the interest set of the socket registered under
    /// `token`. Unknown tokens are ignored.
    pub fn add_interest<S: Source>(
        &mut self,
        source: &mut S,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        let index = match self.find(token) {
            Some(index) => index,
            None => return Ok(()),
        };
        let old = self.entries[index].interests;
        let new = match old {
            Some(interests) => interests | interest,
            None => interest,
        };
        self.entries[index].interests = Some(new);
        match old {
            Some(_) => self.poll.registry().reregister(source, token.into(), new),
            None => self.poll.registry().register(source, token.into(), new),
        }
    }

    /// Remove `interest` from the interest set of the socket registered
    /// under `token`. Unknown tokens are ignored; removing the last
    /// interest deregisters the socket from the OS but keeps its table
    /// entry.
    pub fn remove_interest<S: Source>(
        &mut self,
        source: &mut S,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        let index = match self.find(token) {
            Some(index) => index,
            None => return Ok(()),
        };
        let old = match self.entries[index].interests {
            Some(interests) => interests,
            None => return Ok(()),
        };
        match old.remove(interest) {
            Some(new) => {
                self.entries[index].interests = Some(new);
                self.poll.registry().reregister(source, token.into(), new)
            }
            None => {
                self.entries[index].interests = None;
                self.poll.registry().deregister(source)
            }
        }
    }

    /// Unregister the socket registered under `token`.
    pub fn remove<S: Source>(&mut self, source: &mut S, token: Token) -> io::Result<()> {
        let index = match self.find(token) {
            Some(index) => index,
            None => return Ok(()),
        };
        let result = match self.entries[index].interests {
            Some(_) => self.poll.registry().deregister(source),
            None => Ok(()),
        };
        // Swap with the last entry; pull the cursor back when it already
        // passed the removed slot.
        drop(self.entries.swap_remove(index));
        if self.cursor > index {
            self.cursor -= 1;
        }
        result
    }

    /// Block until a registered socket is ready and return one event.
    ///
    /// Events buffered by an earlier poll are returned first, one per call;
    /// only once all of them are handed out is the OS polled again.
    pub fn wait(&mut self) -> io::Result<Event> {
        loop {
            self.skip();
            if self.cursor < self.entries.len() {
                return Ok(self.take_event());
            }

            match self.poll.poll(&mut self.events, None) {
                Ok(()) => {}
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
            for event in self.events.iter() {
                let token = Token::from(event.token());
                let mut mask = 0;
                if event.is_readable() || event.is_read_closed() {
                    mask |= READY_RECV;
                }
                if event.is_writable() || event.is_write_closed() {
                    mask |= READY_SEND;
                }
                if mask == 0 {
                    // Error or hangup with nothing to read or write.
                    mask = READY_FAIL;
                }
                if let Some(entry) = self.entries.iter_mut().find(|e| e.token == token) {
                    entry.ready |= mask;
                }
            }
            self.cursor = 0;
        }
    }

    /// Move the cursor forward to the next entry with unreported readiness.
    fn skip(&mut self) {
        while self.cursor < self.entries.len() && self.entries[self.cursor].ready == 0 {
            self.cursor += 1;
        }
    }

    /// Take one event from the entry under the cursor, which must have
    /// unreported readiness.
    fn take_event(&mut self) -> Event {
        let entry = &mut self.entries[self.cursor];
        debug_assert!(entry.ready != 0);
        if entry.ready & READY_RECV != 0 {
            entry.ready &= !READY_RECV;
            return Event {
                kind: EventKind::Recv,
                token: entry.token,
            };
        }
        if entry.ready & READY_SEND != 0 {
            entry.ready &= !READY_SEND;
            return Event {
                kind: EventKind::Send,
                token: entry.token,
            };
        }
        entry.ready = 0;
        Event {
            kind: EventKind::Failure,
            token: entry.token,
        }
    }

    fn find(&self, token: Token) -> Option<usize> {
        self.entries.iter().position(|entry| entry.token == token)
    }
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("registered", &self.entries.len())
            .field("capacity", &self.capacity)
            .field("cursor", &self.cursor)
            .finish()
    }
}
