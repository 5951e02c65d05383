//! A thin acceptor: binds one address, registers a [`Channel`] for read
//! readiness, and hands off `accept()`'d streams to an `accept` callback.
//!
//! This is deliberately policy-free. It does not size a backlog beyond
//! `mio`'s default, does not pace the accept loop, and does not apply
//! `SO_REUSEPORT` — those decisions belong to whatever server builds on top,
//! matching this crate's treatment of the acceptor as a mostly-external
//! collaborator (only a minimal wrapper lives here so the rest of the crate
//! has something runnable to accept connections with).

use std::cell::RefCell;
use std::io;
use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::rc::Rc;

use crate::channel::Channel;
use crate::event_loop::EventLoopHandle;

type AcceptCallback = Box<dyn FnMut(mio::net::TcpStream, SocketAddr)>;

/// Wraps `mio::net::TcpListener`, dispatching accept readiness through the
/// same [`Channel`] abstraction every other descriptor in this crate uses.
pub struct TcpListener {
    loop_handle: EventLoopHandle,
    listener: Rc<RefCell<Option<mio::net::TcpListener>>>,
    channel: Channel,
}

impl TcpListener {
    /// Binds `addr`. Read interest is armed only once
    /// [`TcpListener::set_accept_callback`] has been called, mirroring how a
    /// `TcpConnection` only starts delivering reads after
    /// `connection_established`.
    pub fn bind(loop_handle: EventLoopHandle, addr: SocketAddr) -> io::Result<TcpListener> {
        let listener = mio::net::TcpListener::bind(addr)?;
        let fd = listener.as_raw_fd();
        let channel = Channel::new(loop_handle.clone(), fd);
        Ok(TcpListener {
            loop_handle,
            listener: Rc::new(RefCell::new(Some(listener))),
            channel,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener
            .borrow()
            .as_ref()
            .expect("local_addr called after the listener was closed")
            .local_addr()
    }

    /// Registers `cb` and enables read interest. Every readable event drains
    /// the kernel's pending-connection backlog in a loop, since a single
    /// readiness notification can correspond to more than one queued
    /// connection.
    pub fn set_accept_callback(&self, cb: impl FnMut(mio::net::TcpStream, SocketAddr) + 'static) {
        let accept_cb = Rc::new(RefCell::new(cb));
        let listener = self.listener.clone();
        self.channel.set_read_callback(move |_ts| {
            loop {
                let accepted = match listener.borrow().as_ref() {
                    Some(l) => l.accept(),
                    None => break,
                };
                match accepted {
                    Ok((stream, addr)) => (accept_cb.borrow_mut())(stream, addr),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) => {
                        log::warn!("accept() failed: {e}");
                        break;
                    }
                }
            }
        });
        self.channel.enable_reading();
    }

    /// Stops accepting and deregisters the channel. The underlying socket is
    /// closed once the last reference to the wrapped listener drops.
    pub fn close(&self) {
        self.loop_handle.assert_in_loop_thread();
        self.channel.disable_all();
        self.channel.remove();
        self.listener.borrow_mut().take();
    }
}
