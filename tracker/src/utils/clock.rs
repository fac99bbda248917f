//! Time source for the tracker.
//!
//! The session state machine works on wall-clock timestamps, but elapsed time
//! must not jump when the system clock is adjusted. [`SystemClock`] anchors a
//! wall-clock reading to a [`tokio::time::Instant`] and derives every later
//! timestamp from the monotonic elapsed time. Because the anchor is a tokio
//! instant, tests running with a paused runtime clock can advance time
//! deterministically.

use chrono::{DateTime, Utc};
use tokio::time::Instant;

/// Provides the current time to the tracker.
pub trait Clock: Send + Sync + 'static {
    /// Returns the current time.
    fn now(&self) -> DateTime<Utc>;
}

/// Monotonic clock anchored to the wall-clock time at construction.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    anchor_wall: DateTime<Utc>,
    anchor: Instant,
}

impl SystemClock {
    /// Creates a clock anchored at the current time.
    #[must_use]
    pub fn new() -> Self {
        Self {
            anchor_wall: Utc::now(),
            anchor: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.anchor.elapsed())
            .unwrap_or_else(|_| chrono::Duration::zero());
        self.anchor_wall + elapsed
    }
}
