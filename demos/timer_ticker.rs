//! Demonstrates `run_after`/`run_every`/`cancel_timer`: a one-shot timer at
//! T+50ms, a repeating tick every 100ms, and cancellation of the repeater
//! after five firings.

use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

use reactor_core::EventLoop;

fn main() {
    env_logger::init();

    let event_loop = EventLoop::new().expect("failed to create event loop");
    let handle = event_loop.handle();

    handle.run_after(Duration::from_millis(50), {
        let handle = handle.clone();
        move || {
            log::info!("one-shot timer fired");
            let _ = &handle;
        }
    });

    let ticks = Rc::new(Cell::new(0u32));
    let timer_id = Rc::new(Cell::new(None));
    let timer_id_for_cb = timer_id.clone();
    let id = handle.run_every(Duration::from_millis(100), {
        let handle = handle.clone();
        let ticks = ticks.clone();
        move || {
            let n = ticks.get() + 1;
            ticks.set(n);
            log::info!("tick {n}");
            if n >= 5 {
                if let Some(id) = timer_id_for_cb.get() {
                    handle.cancel_timer(id);
                }
                handle.quit();
            }
        }
    });
    timer_id.set(Some(id));

    event_loop.run().expect("event loop terminated with an error");
}
