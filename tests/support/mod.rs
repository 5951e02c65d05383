// Not every test exercises every helper.
#![allow(dead_code)]

use std::sync::mpsc;
use std::sync::Once;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use reactor_core::{EventLoop, EventLoopHandle, EventLoopProxy};

pub fn init() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = env_logger::try_init();
    });
}

/// A reactor running on its own background thread, reachable from the test
/// thread only through its [`EventLoopProxy`] — exactly the boundary the
/// crate draws between loop-owned (`Rc`) state and foreign-thread access.
///
/// `build` runs on the background thread, before the loop starts spinning,
/// and gets the loop's own (thread-confined) [`EventLoopHandle`] to construct
/// whatever listener or connection the test needs; anything it wants to hand
/// back to the test thread (a bound address, a result channel) must travel
/// out through `R`, which is why `R: Send`.
pub struct BackgroundLoop {
    pub proxy: EventLoopProxy,
    join: Option<JoinHandle<()>>,
}

impl BackgroundLoop {
    pub fn spawn<F, R>(build: F) -> (BackgroundLoop, R)
    where
        F: FnOnce(&EventLoopHandle) -> R + Send + 'static,
        R: Send + 'static,
    {
        init();
        let (tx, rx) = mpsc::channel();
        let join = thread::spawn(move || {
            let event_loop = EventLoop::new().expect("background thread owns no loop yet");
            let result = build(&event_loop.handle());
            tx.send((event_loop.proxy(), result))
                .expect("test thread stopped waiting for startup");
            event_loop.run().expect("event loop run failed");
        });
        let (proxy, result) = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("background loop failed to start within 5s");
        (BackgroundLoop { proxy, join: Some(join) }, result)
    }
}

impl Drop for BackgroundLoop {
    fn drop(&mut self) {
        self.proxy.quit();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

/// Blocks up to 5s for a value on `rx`, failing the test rather than hanging
/// forever if the background loop never produces one.
pub fn recv<T>(rx: &mpsc::Receiver<T>) -> T {
    rx.recv_timeout(Duration::from_secs(5))
        .expect("timed out waiting for background loop event")
}

/// `len` bytes of random content, so a codec test can't accidentally pass by
/// echoing back a buffer it never actually touched (an all-zero payload would
/// survive a buggy `append`/`retrieve` pairing that a patterned one wouldn't).
pub fn random_payload(len: usize) -> Vec<u8> {
    use rand::Rng;
    let mut bytes = vec![0u8; len];
    rand::rng().fill(bytes.as_mut_slice());
    bytes
}
