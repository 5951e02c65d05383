//! S6 from the design's scenario table: a connection with a large pending
//! write must deliver every queued byte before its write side half-closes.

mod support;

use std::cell::RefCell;
use std::collections::HashMap;
use std::io::Read;
use std::net::{SocketAddr, TcpStream};
use std::rc::Rc;

use reactor_core::{EventLoopHandle, TcpConnection, TcpListener};

use support::BackgroundLoop;

#[test]
fn shutdown_drains_queued_output_before_half_closing() {
    // Large enough that the server's single `write()` call in `send_in_loop`
    // almost certainly can't hand the whole thing to the kernel at once, so
    // the remainder sits in the output buffer when `shutdown()` is called.
    let payload = support::random_payload(4 * 1024 * 1024);
    let payload_for_server = payload.clone();

    let (_server, addr): (BackgroundLoop, SocketAddr) =
        BackgroundLoop::spawn(move |handle: &EventLoopHandle| {
            let listener =
                TcpListener::bind(handle.clone(), "127.0.0.1:0".parse().unwrap()).unwrap();
            let addr = listener.local_addr().unwrap();

            let connections: Rc<RefCell<HashMap<String, TcpConnection>>> =
                Rc::new(RefCell::new(HashMap::new()));
            let handle_for_accept = handle.clone();
            let payload = payload_for_server.clone();
            listener.set_accept_callback(move |stream, peer_addr| {
                let name = format!("{peer_addr}");
                let local_addr = stream.local_addr().unwrap_or(peer_addr);
                let conn = TcpConnection::new(
                    handle_for_accept.clone(),
                    name.clone(),
                    stream,
                    local_addr,
                    peer_addr,
                );
                conn.set_close_callback({
                    let connections = connections.clone();
                    move |conn| {
                        connections.borrow_mut().remove(&conn.name());
                    }
                });
                connections.borrow_mut().insert(name, conn.clone());
                conn.connection_established();
                conn.send(&payload);
                conn.shutdown();
            });

            // See `tests/codec.rs` for why letting `listener` drop here is safe.
            addr
        });

    let mut client = TcpStream::connect(addr).expect("failed to connect");
    let mut received = Vec::new();
    client
        .read_to_end(&mut received)
        .expect("read should reach EOF once the server half-closes");

    assert_eq!(received.len(), payload.len());
    assert_eq!(received, payload);
}
