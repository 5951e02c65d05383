//! A length-prefixed echo server: a 4-byte big-endian length header followed
//! by that many bytes of payload. Header values outside `[0, 65536]` are
//! treated as a protocol violation and the offending connection is shut down.
//!
//! Run with `cargo run --example length_prefix_echo -- 127.0.0.1:9000`, then
//! connect with anything that speaks the framing (see `tests/codec.rs` for a
//! client that does).

use std::cell::RefCell;
use std::collections::HashMap;
use std::env;
use std::net::SocketAddr;
use std::rc::Rc;

use reactor_core::{Buffer, EventLoop, ReactorError, TcpConnection, TcpListener, Timestamp};

const MAX_FRAME: u32 = 65536;

fn main() {
    env_logger::init();

    let addr: SocketAddr = env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:9000".to_string())
        .parse()
        .expect("invalid listen address");

    let event_loop = EventLoop::new().expect("failed to create event loop");
    let handle = event_loop.handle();

    let listener = TcpListener::bind(handle.clone(), addr).expect("failed to bind listener");
    log::info!("listening on {}", listener.local_addr().unwrap());

    // Connections must outlive any single dispatch, so the server keeps the
    // one strong reference to each in a map keyed by name; every callback
    // only ever holds a clone.
    let connections: Rc<RefCell<HashMap<String, TcpConnection>>> = Rc::new(RefCell::new(HashMap::new()));
    let mut next_id = 0u64;

    listener.set_accept_callback({
        let handle = handle.clone();
        let connections = connections.clone();
        move |stream, peer_addr| {
            next_id += 1;
            let name = format!("conn-{next_id}");
            let local_addr = stream.local_addr().unwrap_or(peer_addr);
            let conn = TcpConnection::new(handle.clone(), name.clone(), stream, local_addr, peer_addr);
            conn.set_nodelay(true).ok();

            conn.set_message_callback(on_message);
            conn.set_close_callback({
                let connections = connections.clone();
                move |conn| {
                    connections.borrow_mut().remove(&conn.name());
                }
            });

            connections.borrow_mut().insert(name, conn.clone());
            conn.connection_established();
        }
    });

    event_loop.run().expect("event loop terminated with an error");
}

fn on_message(conn: TcpConnection, input: &mut Buffer, _receive_time: Timestamp) {
    // A single readiness event may deliver a fragment of the header, the
    // header plus a fragment of the body, or several whole frames back to
    // back; loop until the buffer can't satisfy the next frame.
    loop {
        if input.readable_bytes() < 4 {
            return;
        }
        let len = input.peek_u32();
        if len > MAX_FRAME {
            let err = ReactorError::ProtocolViolation(format!(
                "frame length {len} exceeds {MAX_FRAME}"
            ));
            log::warn!("{}: {err}, shutting down", conn.name());
            conn.shutdown();
            return;
        }
        if input.readable_bytes() < 4 + len as usize {
            // Header complete, body still arriving; wait for more bytes.
            return;
        }
        input.retrieve(4);
        let body = input.retrieve_as_vec(len as usize);

        let mut out = Buffer::new();
        out.append(&body);
        out.prepend_u32(len);
        conn.send_buffer(&mut out);
    }
}
