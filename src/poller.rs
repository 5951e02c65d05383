//! Thin wrapper over the OS readiness multiplexer.
//!
//! Backed by `mio::Poll`, which itself selects epoll, kqueue or `poll()`
//! depending on the target; this module never encodes which one. The only
//! operations exposed are the ones a [`Channel`](crate::channel::Channel)
//! needs: arm/rearm/disarm one descriptor's interest, and block for the next
//! batch of readiness notifications.

use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Poll, Token};

use crate::time::Timestamp;

/// What a [`Channel`](crate::channel::Channel) wants to be notified about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    /// Not currently registered for any readiness (channel disarmed).
    Idle,
    Readable,
    Writable,
    ReadWrite,
}

impl Interest {
    fn to_mio(self) -> Option<mio::Interest> {
        match self {
            Interest::Idle => None,
            Interest::Readable => Some(mio::Interest::READABLE),
            Interest::Writable => Some(mio::Interest::WRITABLE),
            Interest::ReadWrite => Some(mio::Interest::READABLE.add(mio::Interest::WRITABLE)),
        }
    }
}

/// A readiness result for one descriptor, copied out of the `mio::Event` at
/// poll time so it outlives the `Events` buffer it came from.
#[derive(Debug, Clone, Copy, Default)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
    pub read_closed: bool,
    pub write_closed: bool,
    pub priority: bool,
}

impl Readiness {
    fn from_event(event: &mio::event::Event) -> Readiness {
        Readiness {
            readable: event.is_readable(),
            writable: event.is_writable(),
            error: event.is_error(),
            read_closed: event.is_read_closed(),
            write_closed: event.is_write_closed(),
            priority: event.is_priority(),
        }
    }
}

/// Wraps `mio::Poll`, translating our `Interest`/`RawFd` vocabulary into
/// `mio::Registry` calls against borrowed file descriptors via `SourceFd`.
pub struct Poller {
    poll: Poll,
    events: Events,
}

impl Poller {
    pub fn new(events_capacity: usize) -> io::Result<Poller> {
        Ok(Poller {
            poll: Poll::new()?,
            events: Events::with_capacity(events_capacity),
        })
    }

    /// Used once, at `EventLoop` construction, to build the `mio::Waker` that
    /// shares this poller's `Registry`.
    pub fn registry(&self) -> &mio::Registry {
        self.poll.registry()
    }

    pub fn register(&self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        let interest = interest
            .to_mio()
            .expect("register() requires a non-empty interest");
        self.poll
            .registry()
            .register(&mut SourceFd(&fd), token, interest)
    }

    pub fn reregister(&self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        let interest = interest
            .to_mio()
            .expect("reregister() requires a non-empty interest");
        self.poll
            .registry()
            .reregister(&mut SourceFd(&fd), token, interest)
    }

    pub fn deregister(&self, fd: RawFd) -> io::Result<()> {
        self.poll.registry().deregister(&mut SourceFd(&fd))
    }

    /// Blocks up to `timeout` for readiness, returning the time it returned
    /// and the `(Token, Readiness)` pairs observed, in the order the kernel
    /// reported them.
    pub fn poll(&mut self, timeout: Duration) -> io::Result<(Timestamp, Vec<(Token, Readiness)>)> {
        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {
                return Ok((Timestamp::now(), Vec::new()));
            }
            Err(e) => return Err(e),
        }
        let now = Timestamp::now();
        let active = self
            .events
            .iter()
            .map(|e| (e.token(), Readiness::from_event(e)))
            .collect();
        Ok((now, active))
    }
}
