//! Timestamps used to stamp read events and to express timer deadlines.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// A point in time.
///
/// Internally backed by [`Instant`] so that deadline arithmetic is immune to
/// wall-clock adjustments (NTP steps, leap seconds); [`Timestamp::now`] also
/// records a [`SystemTime`] purely for human-readable rendering in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp {
    instant: Instant,
}

impl Timestamp {
    /// Returns the current time.
    pub fn now() -> Timestamp {
        Timestamp {
            instant: Instant::now(),
        }
    }

    /// The underlying monotonic instant, for deadline math against `Instant::now()`.
    pub fn as_instant(&self) -> Instant {
        self.instant
    }

    /// This timestamp plus `d`.
    pub fn add(&self, d: Duration) -> Timestamp {
        Timestamp {
            instant: self.instant + d,
        }
    }

    /// Duration elapsed since this timestamp was recorded, saturating at zero.
    pub fn elapsed(&self) -> Duration {
        self.instant.elapsed()
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Instant carries no wall-clock epoch, so approximate one for display
        // by anchoring the gap between `self` and "now" onto `SystemTime::now()`.
        let now_instant = Instant::now();
        let now_wall = SystemTime::now();
        let wall = if self.instant <= now_instant {
            now_wall
                .checked_sub(now_instant - self.instant)
                .unwrap_or(UNIX_EPOCH)
        } else {
            now_wall
                .checked_add(self.instant - now_instant)
                .unwrap_or(now_wall)
        };
        match wall.duration_since(UNIX_EPOCH) {
            Ok(d) => write!(f, "{}.{:06}", d.as_secs(), d.subsec_micros()),
            Err(_) => write!(f, "<before-epoch>"),
        }
    }
}
