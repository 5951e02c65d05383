//! Binds one file descriptor to an interest mask and a set of callbacks.
//!
//! A `Channel` does not own its descriptor — the connection or listener that
//! created it does — and it does not talk to the poller directly; it asks
//! its owning [`EventLoopHandle`](crate::event_loop::EventLoopHandle) to
//! register, rearm or drop the registration on its behalf. This keeps every
//! poller interaction funneled through one place regardless of how many
//! channels exist.

use std::any::Any;
use std::cell::RefCell;
use std::os::fd::RawFd;
use std::rc::{Rc, Weak};

use mio::Token;

use crate::event_loop::EventLoopHandle;
use crate::poller::{Interest, Readiness};
use crate::time::Timestamp;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RegState {
    New,
    Added,
    Deleted,
}

type ReadCallback = Box<dyn FnMut(Timestamp)>;
type EventCallback = Box<dyn FnMut()>;

struct ChannelInner {
    loop_handle: EventLoopHandle,
    fd: RawFd,
    token: Token,
    interest: Interest,
    reading: bool,
    writing: bool,
    pub(crate) state: RegState,
    event_handling: bool,
    tie: Option<Weak<dyn Any>>,
    read_cb: Option<ReadCallback>,
    write_cb: Option<EventCallback>,
    close_cb: Option<EventCallback>,
    error_cb: Option<EventCallback>,
}

impl ChannelInner {
    fn wanted_interest(&self) -> Interest {
        match (self.reading, self.writing) {
            (false, false) => Interest::Idle,
            (true, false) => Interest::Readable,
            (false, true) => Interest::Writable,
            (true, true) => Interest::ReadWrite,
        }
    }
}

/// A cheaply cloned handle to one registered descriptor.
///
/// Clones share the same underlying state; the last clone to be dropped
/// does *not* automatically deregister the descriptor — call
/// [`Channel::remove`] explicitly before closing the fd, the way the owning
/// connection's teardown path does.
#[derive(Clone)]
pub struct Channel {
    inner: Rc<RefCell<ChannelInner>>,
}

impl Channel {
    /// Wraps `fd` (not owned) with no interest and no callbacks, allocating a
    /// token from `loop_handle` that will identify it in poll results for as
    /// long as it stays registered.
    pub fn new(loop_handle: EventLoopHandle, fd: RawFd) -> Channel {
        let token = loop_handle.alloc_token();
        Channel {
            inner: Rc::new(RefCell::new(ChannelInner {
                loop_handle,
                fd,
                token,
                interest: Interest::Idle,
                reading: false,
                writing: false,
                state: RegState::New,
                event_handling: false,
                tie: None,
                read_cb: None,
                write_cb: None,
                close_cb: None,
                error_cb: None,
            })),
        }
    }

    pub fn fd(&self) -> RawFd {
        self.inner.borrow().fd
    }

    pub fn token(&self) -> Token {
        self.inner.borrow().token
    }

    pub fn set_read_callback(&self, cb: impl FnMut(Timestamp) + 'static) {
        self.inner.borrow_mut().read_cb = Some(Box::new(cb));
    }

    pub fn set_write_callback(&self, cb: impl FnMut() + 'static) {
        self.inner.borrow_mut().write_cb = Some(Box::new(cb));
    }

    pub fn set_close_callback(&self, cb: impl FnMut() + 'static) {
        self.inner.borrow_mut().close_cb = Some(Box::new(cb));
    }

    pub fn set_error_callback(&self, cb: impl FnMut() + 'static) {
        self.inner.borrow_mut().error_cb = Some(Box::new(cb));
    }

    /// Ties this channel's lifetime to `owner`: before dispatching any
    /// callback, `handle_event` first tries to upgrade a weak reference to
    /// `owner`, and silently drops the event if that fails. This is what
    /// lets a connection's own read callback be the thing that removes and
    /// drops the connection without the `Channel` call stack reading freed
    /// state on the way back out.
    pub fn tie(&self, owner: Rc<dyn Any>) {
        self.inner.borrow_mut().tie = Some(Rc::downgrade(&owner));
    }

    pub fn is_reading(&self) -> bool {
        self.inner.borrow().reading
    }

    pub fn is_writing(&self) -> bool {
        self.inner.borrow().writing
    }

    pub fn is_none_event(&self) -> bool {
        let inner = self.inner.borrow();
        !inner.reading && !inner.writing
    }

    pub fn enable_reading(&self) {
        self.inner.borrow_mut().reading = true;
        self.update();
    }

    pub fn disable_reading(&self) {
        self.inner.borrow_mut().reading = false;
        self.update();
    }

    pub fn enable_writing(&self) {
        self.inner.borrow_mut().writing = true;
        self.update();
    }

    pub fn disable_writing(&self) {
        self.inner.borrow_mut().writing = false;
        self.update();
    }

    pub fn disable_all(&self) {
        {
            let mut inner = self.inner.borrow_mut();
            inner.reading = false;
            inner.writing = false;
        }
        self.update();
    }

    /// Drops the registration entirely. Must be called (from the loop
    /// thread, outside of this channel's own callback) before the
    /// descriptor is closed.
    pub fn remove(&self) {
        {
            let inner = self.inner.borrow();
            assert!(
                !inner.event_handling,
                "a channel cannot remove itself from within its own callback"
            );
        }
        let handle = self.inner.borrow().loop_handle.clone();
        handle.remove_channel(self);
    }

    fn update(&self) {
        let interest = {
            let mut inner = self.inner.borrow_mut();
            inner.interest = inner.wanted_interest();
            inner.interest
        };
        let handle = self.inner.borrow().loop_handle.clone();
        handle.update_channel(self, interest);
    }

    pub(crate) fn state(&self) -> RegState {
        self.inner.borrow().state
    }

    pub(crate) fn set_state(&self, state: RegState) {
        self.inner.borrow_mut().state = state;
    }

    pub(crate) fn interest(&self) -> Interest {
        self.inner.borrow().interest
    }

    /// Runs the dispatch precedence described at module level for one
    /// readiness result. Called by the event loop with the channel already
    /// looked up from its poll-result token.
    pub fn handle_event(&self, receive_time: Timestamp, readiness: Readiness) {
        let guard = {
            let inner = self.inner.borrow();
            match &inner.tie {
                Some(weak) => weak.upgrade(),
                None => Some(Rc::new(()) as Rc<dyn Any>),
            }
        };
        let Some(_guard) = guard else {
            // The tied owner is gone; there is nothing left to dispatch to.
            return;
        };
        self.inner.borrow_mut().event_handling = true;
        self.dispatch(receive_time, readiness);
        self.inner.borrow_mut().event_handling = false;
    }

    fn dispatch(&self, receive_time: Timestamp, readiness: Readiness) {
        if readiness.read_closed && !readiness.readable {
            if let Some(cb) = self.inner.borrow_mut().close_cb.as_mut() {
                cb();
            }
        }
        if readiness.error {
            if let Some(cb) = self.inner.borrow_mut().error_cb.as_mut() {
                cb();
            }
        }
        if readiness.readable || readiness.priority {
            if let Some(cb) = self.inner.borrow_mut().read_cb.as_mut() {
                cb(receive_time);
            }
        }
        if readiness.writable {
            if let Some(cb) = self.inner.borrow_mut().write_cb.as_mut() {
                cb();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::EventLoop;
    use std::cell::Cell;

    fn test_channel() -> (EventLoop, Channel) {
        let event_loop = EventLoop::new().expect("thread should own no loop yet");
        let channel = Channel::new(event_loop.handle(), -1);
        (event_loop, channel)
    }

    #[test]
    fn hangup_without_readable_fires_only_close() {
        let (_event_loop, channel) = test_channel();
        let read = Rc::new(Cell::new(false));
        let write = Rc::new(Cell::new(false));
        let close = Rc::new(Cell::new(false));
        let error = Rc::new(Cell::new(false));
        channel.set_read_callback({
            let f = read.clone();
            move |_| f.set(true)
        });
        channel.set_write_callback({
            let f = write.clone();
            move || f.set(true)
        });
        channel.set_close_callback({
            let f = close.clone();
            move || f.set(true)
        });
        channel.set_error_callback({
            let f = error.clone();
            move || f.set(true)
        });

        channel.handle_event(
            Timestamp::now(),
            Readiness {
                read_closed: true,
                ..Default::default()
            },
        );

        assert!(close.get());
        assert!(!read.get());
        assert!(!write.get());
        assert!(!error.get());
    }

    #[test]
    fn error_fires_only_error_callback() {
        let (_event_loop, channel) = test_channel();
        let read = Rc::new(Cell::new(false));
        let error = Rc::new(Cell::new(false));
        channel.set_read_callback({
            let f = read.clone();
            move |_| f.set(true)
        });
        channel.set_error_callback({
            let f = error.clone();
            move || f.set(true)
        });

        channel.handle_event(
            Timestamp::now(),
            Readiness {
                error: true,
                ..Default::default()
            },
        );

        assert!(error.get());
        assert!(!read.get());
    }

    #[test]
    fn read_closed_with_readable_still_delivers_the_read_not_the_close() {
        let (_event_loop, channel) = test_channel();
        let read = Rc::new(Cell::new(false));
        let close = Rc::new(Cell::new(false));
        channel.set_read_callback({
            let f = read.clone();
            move |_| f.set(true)
        });
        channel.set_close_callback({
            let f = close.clone();
            move || f.set(true)
        });

        channel.handle_event(
            Timestamp::now(),
            Readiness {
                readable: true,
                read_closed: true,
                ..Default::default()
            },
        );

        assert!(read.get());
        assert!(!close.get());
    }

    #[test]
    fn writable_fires_the_write_callback() {
        let (_event_loop, channel) = test_channel();
        let write = Rc::new(Cell::new(false));
        channel.set_write_callback({
            let f = write.clone();
            move || f.set(true)
        });

        channel.handle_event(
            Timestamp::now(),
            Readiness {
                writable: true,
                ..Default::default()
            },
        );

        assert!(write.get());
    }

    #[test]
    fn dropping_the_tied_owner_suppresses_dispatch() {
        let (_event_loop, channel) = test_channel();
        let read = Rc::new(Cell::new(false));
        channel.set_read_callback({
            let f = read.clone();
            move |_| f.set(true)
        });
        let owner: Rc<dyn Any> = Rc::new(());
        channel.tie(owner.clone());
        drop(owner);

        channel.handle_event(
            Timestamp::now(),
            Readiness {
                readable: true,
                ..Default::default()
            },
        );

        assert!(!read.get());
    }
}
