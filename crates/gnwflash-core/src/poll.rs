//! Fixed-interval busy polling
//!
//! Every wait in the protocol is a poll of some shared word followed by a
//! sleep. Time is read through [`Clock`] so tests can run the full deadline
//! logic with [`FakeClock`] without sleeping.

use std::cell::Cell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

/// Default interval between two polls
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Default deadline for a single wait
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Source of time for polling loops
pub trait Clock {
    /// Current instant
    fn now(&self) -> Instant;

    /// Block for `duration`
    fn sleep(&self, duration: Duration);
}

/// Wall clock backed by `std::time` and `std::thread::sleep`
#[derive(Debug, Clone, Copy, Default)]
pub struct StdClock;

impl Clock for StdClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Clock that only advances when slept on
///
/// Clones share the same timeline, so a test can hand one clone to the
/// engine and keep another to inspect elapsed time.
#[derive(Debug, Clone)]
pub struct FakeClock {
    start: Instant,
    elapsed: Rc<Cell<Duration>>,
}

impl FakeClock {
    /// Create a clock at time zero
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            elapsed: Rc::new(Cell::new(Duration::ZERO)),
        }
    }

    /// Time slept so far
    pub fn elapsed(&self) -> Duration {
        self.elapsed.get()
    }

    /// Move time forward without sleeping
    pub fn advance(&self, duration: Duration) {
        self.elapsed.set(self.elapsed.get() + duration);
    }
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for FakeClock {
    fn now(&self) -> Instant {
        self.start + self.elapsed.get()
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }
}

/// Poll interval and deadline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    /// Sleep between two polls
    pub interval: Duration,
    /// Give up after this long
    pub timeout: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

/// Call `check` every `interval` until it yields a value or `timeout` passes
///
/// `check` runs at least once, and once more at (or just after) the
/// deadline, so a condition that resolves exactly at the deadline is still
/// seen. Errors from `check` abort the wait immediately.
pub fn poll_until<C, T, F>(
    clock: &C,
    interval: Duration,
    timeout: Duration,
    waiting_for: &str,
    mut check: F,
) -> Result<T>
where
    C: Clock + ?Sized,
    F: FnMut() -> Result<Option<T>>,
{
    let start = clock.now();
    let deadline = start + timeout;

    loop {
        if let Some(value) = check()? {
            return Ok(value);
        }

        let now = clock.now();
        if now >= deadline {
            return Err(Error::Timeout {
                waiting_for: waiting_for.to_string(),
                elapsed: now - start,
            });
        }

        clock.sleep(interval.min(deadline - now));
    }
}
