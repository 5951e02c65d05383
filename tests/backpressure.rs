//! S3 from the design's scenario table: a client that does not read lets the
//! server's output buffer back up past the high-water mark.

mod support;

use std::cell::RefCell;
use std::collections::HashMap;
use std::net::{SocketAddr, TcpStream};
use std::rc::Rc;
use std::sync::mpsc;

use reactor_core::{EventLoopHandle, TcpConnection, TcpListener};

use support::BackgroundLoop;

#[test]
fn high_water_mark_fires_once_output_backs_up() {
    let mark = 4096usize;
    // Large enough that the kernel send buffer plus one `write()` call can't
    // absorb it all while the client is not reading.
    let payload = support::random_payload(8 * 1024 * 1024);
    let payload_for_server = payload.clone();

    let (tx, rx) = mpsc::channel::<usize>();

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
                conn.set_high_water_mark(mark);
                conn.set_high_water_mark_callback({
                    let tx = tx.clone();
                    move |_conn, len| {
                        let _ = tx.send(len);
                    }
                });
                conn.set_close_callback({
                    let connections = connections.clone();
                    move |conn| {
                        connections.borrow_mut().remove(&conn.name());
                    }
                });
                connections.borrow_mut().insert(name, conn.clone());
                conn.connection_established();
                conn.send(&payload);
            });

            // See `tests/codec.rs` for why letting `listener` drop here is safe.
            addr
        });

    // Connect but never read: nothing drains the server's socket, so its
    // single immediate `write()` can only absorb as much as the kernel send
    // buffer holds before the rest queues up in the connection's `Buffer`.
    let client = TcpStream::connect(addr).expect("failed to connect");

    let len = support::recv(&rx);
    assert!(
        len >= mark,
        "high water mark callback fired with only {len} bytes buffered, below the {mark} mark"
    );

    drop(client);
}
