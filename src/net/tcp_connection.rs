//! A buffered, callback-driven duplex TCP stream.

use std::cell::RefCell;
use std::io::Write;
use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::rc::Rc;

use crate::buffer::Buffer;
use crate::channel::Channel;
use crate::error::ReactorError;
use crate::event_loop::EventLoopHandle;
use crate::net::socket;
use crate::time::Timestamp;

/// 64 MiB, the default threshold above which [`TcpConnection::send`] fires
/// its high-water-mark callback.
pub const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

type ConnectionCallback = Box<dyn FnMut(TcpConnection)>;
type MessageCallback = Box<dyn FnMut(TcpConnection, &mut Buffer, Timestamp)>;
type HighWaterMarkCallback = Box<dyn FnMut(TcpConnection, usize)>;

struct TcpConnectionInner {
    loop_handle: EventLoopHandle,
    name: String,
    stream: mio::net::TcpStream,
    channel: Channel,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    state: ConnState,
    input: Buffer,
    output: Buffer,
    high_water_mark: usize,
    connection_cb: Option<ConnectionCallback>,
    message_cb: Option<MessageCallback>,
    write_complete_cb: Option<ConnectionCallback>,
    high_water_cb: Option<HighWaterMarkCallback>,
    close_cb: Option<ConnectionCallback>,
}

/// A shared handle to one connection's state. Every callback receives a
/// clone, so the connection cannot be dropped mid-dispatch even if whatever
/// owns the primary reference (typically a server's connection table) has
/// already let go of it.
#[derive(Clone)]
pub struct TcpConnection(Rc<RefCell<TcpConnectionInner>>);

impl TcpConnection {
    /// Wraps an already-connected stream. Enables `SO_KEEPALIVE`
    /// immediately; call [`TcpConnection::set_nodelay`] for `TCP_NODELAY`,
    /// which is left to the caller's discretion. The connection starts in
    /// `Connecting`; call [`TcpConnection::connection_established`] once it
    /// has been placed wherever it needs to live (e.g. a server's
    /// connection map) to move it to `Connected` and start delivering reads.
    pub fn new(
        loop_handle: EventLoopHandle,
        name: impl Into<String>,
        stream: mio::net::TcpStream,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
    ) -> TcpConnection {
        let name = name.into();
        let fd = stream.as_raw_fd();
        if let Err(e) = socket::set_keepalive(fd, true) {
            log::warn!("failed to enable SO_KEEPALIVE on {name}: {e}");
        }
        let channel = Channel::new(loop_handle.clone(), fd);
        let inner = Rc::new(RefCell::new(TcpConnectionInner {
            loop_handle,
            name,
            stream,
            channel: channel.clone(),
            local_addr,
            peer_addr,
            state: ConnState::Connecting,
            input: Buffer::new(),
            output: Buffer::new(),
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
            connection_cb: None,
            message_cb: None,
            write_complete_cb: None,
            high_water_cb: None,
            close_cb: None,
        }));

        // The channel's callbacks must not hold a strong `Rc` back to this
        // connection: the channel lives inside `inner`, so a strong
        // back-reference would be a cycle that never collects. A `Weak`
        // upgraded on each dispatch (mirroring the tie below, which guards
        // the dispatch itself) avoids that while still reaching the state
        // the callback needs.
        channel.tie(inner.clone());
        let weak = Rc::downgrade(&inner);
        {
            let weak = weak.clone();
            channel.set_read_callback(move |ts| {
                if let Some(inner) = weak.upgrade() {
                    TcpConnection(inner).handle_read(ts);
                }
            });
        }
        {
            let weak = weak.clone();
            channel.set_write_callback(move || {
                if let Some(inner) = weak.upgrade() {
                    TcpConnection(inner).handle_write();
                }
            });
        }
        {
            let weak = weak.clone();
            channel.set_close_callback(move || {
                if let Some(inner) = weak.upgrade() {
                    TcpConnection(inner).handle_close();
                }
            });
        }
        channel.set_error_callback(move || {
            if let Some(inner) = weak.upgrade() {
                TcpConnection(inner).handle_error();
            }
        });

        TcpConnection(inner)
    }

    pub fn name(&self) -> String {
        self.0.borrow().name.clone()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.0.borrow().local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.0.borrow().peer_addr
    }

    pub fn state(&self) -> ConnState {
        self.0.borrow().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnState::Connected
    }

    /// Sets `TCP_NODELAY`. Left to the caller rather than applied
    /// automatically, since Nagle's algorithm is a throughput/latency
    /// trade-off that depends on the protocol built on top.
    pub fn set_nodelay(&self, enable: bool) -> std::io::Result<()> {
        self.0.borrow().stream.set_nodelay(enable)
    }

    pub fn set_high_water_mark(&self, bytes: usize) {
        self.0.borrow_mut().high_water_mark = bytes;
    }

    pub fn set_connection_callback(&self, cb: impl FnMut(TcpConnection) + 'static) {
        self.0.borrow_mut().connection_cb = Some(Box::new(cb));
    }

    pub fn set_message_callback(
        &self,
        cb: impl FnMut(TcpConnection, &mut Buffer, Timestamp) + 'static,
    ) {
        self.0.borrow_mut().message_cb = Some(Box::new(cb));
    }

    pub fn set_write_complete_callback(&self, cb: impl FnMut(TcpConnection) + 'static) {
        self.0.borrow_mut().write_complete_cb = Some(Box::new(cb));
    }

    pub fn set_high_water_mark_callback(&self, cb: impl FnMut(TcpConnection, usize) + 'static) {
        self.0.borrow_mut().high_water_cb = Some(Box::new(cb));
    }

    pub fn set_close_callback(&self, cb: impl FnMut(TcpConnection) + 'static) {
        self.0.borrow_mut().close_cb = Some(Box::new(cb));
    }

    /// Moves the connection from `Connecting` to `Connected`, arms read
    /// readiness, and fires the connection callback. Called once, by
    /// whatever accepted the connection, after it has a place to live.
    pub fn connection_established(&self) {
        self.0.borrow().loop_handle.assert_in_loop_thread();
        {
            let mut inner = self.0.borrow_mut();
            debug_assert_eq!(inner.state, ConnState::Connecting);
            inner.state = ConnState::Connected;
        }
        self.0.borrow().channel.enable_reading();
        self.fire_connection_callback();
    }

    /// Queues `data` for sending. Safe from any thread; off-loop callers pay
    /// for one copy onto the loop, since handing buffer ownership across
    /// threads is not part of this contract.
    pub fn send(&self, data: &[u8]) {
        if self.0.borrow().loop_handle.is_in_loop_thread() {
            self.send_in_loop(data);
        } else {
            let conn = self.clone();
            let owned = data.to_vec();
            self.0
                .borrow()
                .loop_handle
                .run_in_loop(move || conn.send_in_loop(&owned));
        }
    }

    /// Sends and retrieves every readable byte of `buf`.
    pub fn send_buffer(&self, buf: &mut Buffer) {
        let bytes = buf.retrieve_all_as_vec();
        self.send(&bytes);
    }

    fn send_in_loop(&self, data: &[u8]) {
        self.0.borrow().loop_handle.assert_in_loop_thread();
        if self.0.borrow().state != ConnState::Connected {
            log::warn!(
                "send on a connection that is not connected; dropping {} bytes",
                data.len()
            );
            return;
        }

        let (already_writing, output_empty) = {
            let inner = self.0.borrow();
            (inner.channel.is_writing(), inner.output.readable_bytes() == 0)
        };

        let mut wrote = 0usize;
        if !already_writing && output_empty {
            let mut inner = self.0.borrow_mut();
            match inner.stream.write(data) {
                Ok(n) => wrote = n,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    if !is_broken_pipe(&e) {
                        log::error!("write error on {}: {e}", inner.name);
                    }
                    drop(inner);
                    self.handle_error();
                    return;
                }
            }
        }

        if wrote == data.len() {
            if wrote > 0 {
                self.fire_write_complete();
            }
            return;
        }

        let remaining = &data[wrote..];
        let crossed = {
            let mut inner = self.0.borrow_mut();
            let old_len = inner.output.readable_bytes();
            let new_len = old_len + remaining.len();
            let crossed = old_len < inner.high_water_mark && new_len >= inner.high_water_mark;
            inner.output.append(remaining);
            crossed
        };
        if crossed {
            self.fire_high_water_mark();
        }
        self.0.borrow().channel.enable_writing();
    }

    fn handle_write(&self) {
        self.0.borrow().loop_handle.assert_in_loop_thread();
        let remaining = {
            let mut inner = self.0.borrow_mut();
            let chunk = inner.output.peek().to_vec();
            match inner.stream.write(&chunk) {
                Ok(n) => {
                    inner.output.retrieve(n);
                    inner.output.readable_bytes()
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => inner.output.readable_bytes(),
                Err(e) => {
                    if !is_broken_pipe(&e) {
                        log::error!("write error on {}: {e}", inner.name);
                    }
                    drop(inner);
                    self.handle_error();
                    return;
                }
            }
        };

        if remaining == 0 {
            self.0.borrow().channel.disable_writing();
            self.fire_write_complete();
            let disconnecting = self.0.borrow().state == ConnState::Disconnecting;
            if disconnecting {
                self.shutdown_in_loop();
            }
        }
    }

    /// Half-closes the connection once the output buffer drains; idempotent
    /// over the `Connected` state. The read side keeps delivering bytes
    /// until the peer closes.
    pub fn shutdown(&self) {
        let should_queue = {
            let mut inner = self.0.borrow_mut();
            if inner.state == ConnState::Connected {
                inner.state = ConnState::Disconnecting;
                true
            } else {
                false
            }
        };
        if should_queue {
            let conn = self.clone();
            self.0
                .borrow()
                .loop_handle
                .run_in_loop(move || conn.shutdown_in_loop());
        }
    }

    fn shutdown_in_loop(&self) {
        self.0.borrow().loop_handle.assert_in_loop_thread();
        if !self.0.borrow().channel.is_writing() {
            let inner = self.0.borrow();
            if let Err(e) = inner.stream.shutdown(std::net::Shutdown::Write) {
                log::warn!("half-close failed on {}: {e}", inner.name);
            }
        }
    }

    fn handle_read(&self, receive_time: Timestamp) {
        self.0.borrow().loop_handle.assert_in_loop_thread();
        let fd = self.0.borrow().channel.fd();
        let result = self.0.borrow_mut().input.read_fd(fd);
        match result {
            Ok(0) => {
                log::debug!("{}: {}", self.0.borrow().name, ReactorError::PeerClosed);
                self.handle_close();
            }
            Ok(_n) => self.deliver_message(receive_time),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => {
                log::error!("read error on {}: {e}", self.0.borrow().name);
                self.handle_error();
            }
        }
    }

    fn deliver_message(&self, receive_time: Timestamp) {
        let cb = self.0.borrow_mut().message_cb.take();
        if let Some(mut cb) = cb {
            let mut input = std::mem::take(&mut self.0.borrow_mut().input);
            cb(self.clone(), &mut input, receive_time);
            self.0.borrow_mut().input = input;
            self.0.borrow_mut().message_cb = Some(cb);
        }
    }

    /// Asserts state is `Connected` or `Disconnecting`, moves to
    /// `Disconnected`, disables all interest, queues the channel's full
    /// removal for after this dispatch round, then runs the connection and
    /// close callbacks while holding a strong reference to `self` for the
    /// duration.
    fn handle_close(&self) {
        self.0.borrow().loop_handle.assert_in_loop_thread();
        {
            let mut inner = self.0.borrow_mut();
            debug_assert!(matches!(
                inner.state,
                ConnState::Connected | ConnState::Disconnecting
            ));
            inner.state = ConnState::Disconnected;
        }
        let channel = self.0.borrow().channel.clone();
        channel.disable_all();
        // Deferred: `Channel::remove` asserts it is not called from within
        // that same channel's own dispatch, which this callback is still
        // inside of. `queue_in_loop` (not `run_in_loop`, which would call
        // back in directly on this same thread) runs it after the current
        // dispatch round finishes.
        let loop_handle = self.0.borrow().loop_handle.clone();
        loop_handle.queue_in_loop(move || channel.remove());

        self.fire_connection_callback();
        let cb = self.0.borrow_mut().close_cb.take();
        if let Some(mut cb) = cb {
            cb(self.clone());
            self.0.borrow_mut().close_cb = Some(cb);
        }
    }

    /// Logs the socket's pending error, then proceeds through the close path
    /// unless the connection has already been torn down by some other route
    /// (e.g. a read and a write both faulting in the same dispatch round).
    fn handle_error(&self) {
        let name = self.0.borrow().name.clone();
        match self.0.borrow().stream.take_error() {
            Ok(Some(e)) => log::warn!("socket error on {name}: {e}"),
            Ok(None) => log::warn!("socket error reported on {name} (errno unavailable)"),
            Err(e) => log::warn!("failed to query socket error on {name}: {e}"),
        }
        if self.0.borrow().state != ConnState::Disconnected {
            self.handle_close();
        }
    }

    fn fire_connection_callback(&self) {
        let cb = self.0.borrow_mut().connection_cb.take();
        if let Some(mut cb) = cb {
            cb(self.clone());
            self.0.borrow_mut().connection_cb = Some(cb);
        }
    }

    fn fire_write_complete(&self) {
        let conn = self.clone();
        self.0.borrow().loop_handle.queue_in_loop(move || {
            let cb = conn.0.borrow_mut().write_complete_cb.take();
            if let Some(mut cb) = cb {
                cb(conn.clone());
                conn.0.borrow_mut().write_complete_cb = Some(cb);
            }
        });
    }

    fn fire_high_water_mark(&self) {
        let conn = self.clone();
        let len = self.0.borrow().output.readable_bytes();
        self.0.borrow().loop_handle.queue_in_loop(move || {
            let cb = conn.0.borrow_mut().high_water_cb.take();
            if let Some(mut cb) = cb {
                cb(conn.clone(), len);
                conn.0.borrow_mut().high_water_cb = Some(cb);
            }
        });
    }
}

fn is_broken_pipe(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::BrokenPipe | std::io::ErrorKind::ConnectionReset
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn high_water_mark_crosses_at_most_once() {
        // Mirrors the bookkeeping in `send_in_loop`: no stored "did we
        // already fire" flag, just a comparison of old/new lengths against
        // the mark, which by construction can only be true on the append
        // that takes the total from below the mark to at or above it.
        let mark = 1024usize;
        let mut total = 0usize;
        let mut crossings = 0;
        for chunk in [600usize, 600, 600] {
            let old_len = total;
            total += chunk;
            if old_len < mark && total >= mark {
                crossings += 1;
            }
        }
        assert_eq!(crossings, 1);
    }
}
