//! TCP connections and the listener that manufactures them.

mod socket;
mod tcp_connection;
mod tcp_listener;

pub use tcp_connection::{ConnState, TcpConnection};
pub use tcp_listener::TcpListener;
