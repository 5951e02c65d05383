//! S4/S5 from the design's scenario table: timer precision, cancellation
//! mid-fire, and scheduling from a thread that does not own the loop.

mod support;

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::mpsc;
use std::time::{Duration, Instant};

use reactor_core::{EventLoopHandle, TimerId};

use support::BackgroundLoop;

#[test]
fn run_after_fires_once_near_the_requested_delay() {
    let (tx, rx) = mpsc::channel::<()>();
    let start = Instant::now();
    let (_background, ()) = BackgroundLoop::spawn(move |handle: &EventLoopHandle| {
        handle.run_after(Duration::from_millis(50), move || {
            let _ = tx.send(());
        });
    });

    support::recv(&rx);
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(30), "fired too early: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(2), "fired suspiciously late: {elapsed:?}");

    // One-shot: no second tick should ever arrive.
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
}

#[test]
fn run_every_keeps_repeating_until_cancelled_from_its_own_callback() {
    let (tx, rx) = mpsc::channel::<()>();
    let (_background, ()) = BackgroundLoop::spawn(move |handle: &EventLoopHandle| {
        let timer_id: Rc<RefCell<Option<TimerId>>> = Rc::new(RefCell::new(None));
        let handle_for_cancel = handle.clone();
        let timer_id_for_cb = timer_id.clone();
        let mut ticks = 0u32;
        let id = handle.run_every(Duration::from_millis(20), move || {
            ticks += 1;
            let _ = tx.send(());
            if ticks >= 3 {
                // Cancels itself from inside its own expiry callback, the
                // exact race the timer queue's calling_expired/cancelling
                // bookkeeping exists to resolve.
                if let Some(id) = *timer_id_for_cb.borrow() {
                    handle_for_cancel.cancel_timer(id);
                }
            }
        });
        *timer_id.borrow_mut() = Some(id);
    });

    for _ in 0..3 {
        support::recv(&rx);
    }
    assert!(
        rx.recv_timeout(Duration::from_millis(300)).is_err(),
        "timer kept firing after cancelling itself"
    );
}

#[test]
fn cancelling_before_the_deadline_suppresses_it_entirely() {
    let (tx, rx) = mpsc::channel::<()>();
    let (_background, ()) = BackgroundLoop::spawn(move |handle: &EventLoopHandle| {
        let id = handle.run_after(Duration::from_millis(50), move || {
            let _ = tx.send(());
        });
        handle.cancel_timer(id);
    });

    assert!(
        rx.recv_timeout(Duration::from_millis(300)).is_err(),
        "a timer cancelled before its deadline must never fire"
    );
}

#[test]
fn proxy_schedules_timers_from_a_thread_that_does_not_own_the_loop() {
    let (background, ()) = BackgroundLoop::spawn(|_handle: &EventLoopHandle| {});
    let (tx, rx) = mpsc::channel::<()>();

    // `background.proxy` is `Send + Sync`; this call happens on the test
    // thread, not the loop's own thread.
    background.proxy.run_after(Duration::from_millis(30), move || {
        let _ = tx.send(());
    });

    support::recv(&rx);
}
