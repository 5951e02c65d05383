//! A single-threaded, readiness-driven TCP reactor.
//!
//! The crate is organized the way the system it implements is layered:
//! a [`Buffer`](buffer::Buffer) for zero-copy framing, a [`Poller`](poller::Poller)
//! wrapping the OS readiness primitive, a [`Channel`](channel::Channel) binding one
//! descriptor to its interest set and callbacks, a [`TimerQueue`](timer_queue::TimerQueue)
//! multiplexing deadlines onto one kernel timer, an [`EventLoop`](event_loop::EventLoop)
//! tying all of that together, and a [`TcpConnection`](net::TcpConnection) built on top.
//!
//! Only Unix readiness backends are supported; there is no portability shim for
//! non-epoll/kqueue platforms, and the crate is not meant to be used from more than
//! one thread per [`EventLoop`](event_loop::EventLoop).

#![cfg(unix)]

#[macro_use]
mod macros;

pub mod buffer;
pub mod channel;
pub mod error;
pub mod event_loop;
pub mod net;
pub mod poller;
pub mod time;
pub mod timer;
pub mod timer_queue;

pub use buffer::Buffer;
pub use channel::Channel;
pub use error::{ReactorError, Result};
pub use event_loop::{EventLoop, EventLoopConfig, EventLoopHandle, EventLoopProxy};
pub use net::{TcpConnection, TcpListener};
pub use poller::Poller;
pub use time::Timestamp;
pub use timer::TimerId;
pub use timer_queue::TimerQueue;
