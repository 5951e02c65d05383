//! Schedules callbacks against a single kernel timer.
//!
//! Every [`TimerQueue`] backs onto exactly one `timerfd`, rearmed to the
//! soonest pending deadline after every insert, cancel or expiry round; the
//! event loop never polls more than one descriptor to learn "is anything due
//! yet". Timers are kept in two indexes that must stay in sync: a
//! deadline-ordered set used to find what has expired, and a by-id map that
//! owns the callback and lets `cancel` find an arbitrary timer in `O(log n)`.

use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap};
use std::os::fd::RawFd;
use std::rc::Rc;
use std::time::Duration;

use crate::channel::Channel;
use crate::event_loop::EventLoopHandle;
use crate::time::Timestamp;
use crate::timer::{Timer, TimerId};

fn duration_to_timespec(d: Duration) -> libc::timespec {
    libc::timespec {
        tv_sec: d.as_secs() as libc::time_t,
        tv_nsec: d.subsec_nanos() as libc::c_long,
    }
}

/// Arms `fd` to fire once at `deadline` relative to now, or disarms it if
/// `deadline` is `None`. A near-zero relative duration is bumped up slightly
/// so the kernel does not treat the new value as "disarm".
fn arm_timerfd(fd: RawFd, deadline: Option<Timestamp>) -> std::io::Result<()> {
    let relative = match deadline {
        Some(ts) => {
            let now = Timestamp::now();
            if ts > now {
                ts.as_instant().duration_since(now.as_instant())
            } else {
                Duration::from_micros(100)
            }
        }
        None => Duration::from_secs(0),
    };
    let new_value = libc::itimerspec {
        it_interval: libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        },
        it_value: duration_to_timespec(relative),
    };
    syscall!(timerfd_settime(
        fd,
        0,
        &new_value as *const libc::itimerspec,
        std::ptr::null_mut(),
    ))?;
    Ok(())
}

fn create_timerfd() -> std::io::Result<RawFd> {
    syscall!(timerfd_create(
        libc::CLOCK_MONOTONIC,
        libc::TFD_NONBLOCK | libc::TFD_CLOEXEC,
    ))
}

struct TimerQueueState {
    fd: RawFd,
    /// Deadline order, used to find what has expired; `u64` is the timer's
    /// sequence number, breaking ties between timers sharing a deadline.
    by_deadline: BTreeSet<(Timestamp, u64)>,
    by_id: HashMap<u64, Timer>,
    calling_expired: bool,
    cancelling: std::collections::HashSet<u64>,
}

impl TimerQueueState {
    fn earliest(&self) -> Option<Timestamp> {
        self.by_deadline.iter().next().map(|(ts, _)| *ts)
    }
}

/// A handle to the event loop's timer facility. Cheaply cloned; clones share
/// the same underlying kernel timer and indexes.
#[derive(Clone)]
pub struct TimerQueue {
    state: Rc<RefCell<TimerQueueState>>,
    channel: Channel,
}

impl TimerQueue {
    pub(crate) fn new(loop_handle: EventLoopHandle) -> std::io::Result<TimerQueue> {
        let fd = create_timerfd()?;
        let state = Rc::new(RefCell::new(TimerQueueState {
            fd,
            by_deadline: BTreeSet::new(),
            by_id: HashMap::new(),
            calling_expired: false,
            cancelling: std::collections::HashSet::new(),
        }));
        let channel = Channel::new(loop_handle, fd);
        let queue = TimerQueue { state, channel };
        let on_read = {
            let queue = queue.clone();
            move |_receive_time: Timestamp| queue.handle_read()
        };
        queue.channel.set_read_callback(on_read);
        queue.channel.enable_reading();
        Ok(queue)
    }

    /// Inserts `callback` under the identity `id`, to run once at
    /// `expiration` and repeating every `interval` if given.
    ///
    /// `id` is assigned by the caller (`EventLoopHandle` hands out sequence
    /// numbers from a shared atomic counter) rather than by this method,
    /// because `run_at`/`run_after`/`run_every` must be able to return a
    /// `TimerId` synchronously even when the actual insertion is deferred
    /// onto the loop thread via `run_in_loop`.
    pub(crate) fn insert(
        &self,
        id: TimerId,
        expiration: Timestamp,
        interval: Option<Duration>,
        callback: Box<dyn FnMut()>,
    ) {
        let mut state = self.state.borrow_mut();
        let timer = Timer::new(callback, expiration, interval, id.0);
        state.by_deadline.insert((expiration, id.0));
        state.by_id.insert(id.0, timer);
        let earliest = state.earliest();
        drop(state);
        if earliest == Some(expiration) {
            let _ = arm_timerfd(self.channel.fd(), earliest);
        }
    }

    /// Cancels a previously scheduled timer. A no-op if it already fired (a
    /// one-shot) or was already cancelled.
    pub fn cancel(&self, id: TimerId) {
        let mut state = self.state.borrow_mut();
        if let Some(timer) = state.by_id.remove(&id.0) {
            state.by_deadline.remove(&(timer.expiration, id.0));
        } else if state.calling_expired {
            // It was popped out of the indexes for its own expiry callback,
            // which is currently on the stack above us (it's cancelling
            // itself, or a sibling expired timer is cancelling it). Record
            // it so the post-callback re-arm step does not resurrect it.
            state.cancelling.insert(id.0);
        }
    }

    fn handle_read(&self) {
        let mut drain = [0u8; 8];
        let _ = syscall!(read(
            self.channel.fd(),
            drain.as_mut_ptr() as *mut libc::c_void,
            drain.len(),
        ));

        let now = Timestamp::now();
        let mut expired = {
            let mut state = self.state.borrow_mut();
            state.calling_expired = true;
            state.cancelling.clear();
            let due: Vec<(Timestamp, u64)> = state
                .by_deadline
                .iter()
                .copied()
                .take_while(|(ts, _)| *ts <= now)
                .collect();
            let mut timers = Vec::with_capacity(due.len());
            for key in due {
                state.by_deadline.remove(&key);
                if let Some(timer) = state.by_id.remove(&key.1) {
                    timers.push(timer);
                }
            }
            timers
        };

        // Run callbacks with no borrow held, so they may freely insert or
        // cancel timers of their own, including cancelling each other.
        for timer in expired.iter_mut() {
            (timer.callback)();
        }

        {
            let mut state = self.state.borrow_mut();
            state.calling_expired = false;
            for mut timer in expired {
                if timer.is_repeating() && !state.cancelling.contains(&timer.seq) {
                    timer.restart(now);
                    state.by_deadline.insert((timer.expiration, timer.seq));
                    state.by_id.insert(timer.seq, timer);
                }
            }
            state.cancelling.clear();
            let earliest = state.earliest();
            drop(state);
            let _ = arm_timerfd(self.channel.fd(), earliest);
        }
    }
}
