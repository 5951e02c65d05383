//! A single scheduled callback, as tracked internally by [`TimerQueue`](crate::timer_queue::TimerQueue).

use std::time::Duration;

use crate::time::Timestamp;

/// Identifies one scheduled timer for cancellation.
///
/// Backed by a monotonically increasing sequence number. Nothing here
/// reuses a freed address the way a pointer-based identity would need to
/// guard against, so the sequence alone is already unique.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerId(pub(crate) u64);

pub(crate) struct Timer {
    pub(crate) callback: Box<dyn FnMut()>,
    pub(crate) expiration: Timestamp,
    pub(crate) interval: Option<Duration>,
    pub(crate) seq: u64,
}

impl Timer {
    pub(crate) fn new(
        callback: Box<dyn FnMut()>,
        expiration: Timestamp,
        interval: Option<Duration>,
        seq: u64,
    ) -> Timer {
        Timer {
            callback,
            expiration,
            interval,
            seq,
        }
    }

    pub(crate) fn is_repeating(&self) -> bool {
        self.interval.is_some()
    }

    /// Advances `expiration` by one interval from `now`. Only meaningful for
    /// repeating timers; callers check [`Timer::is_repeating`] first.
    pub(crate) fn restart(&mut self, now: Timestamp) {
        if let Some(interval) = self.interval {
            self.expiration = now.add(interval);
        }
    }
}
