//! Application clocks.

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;

/// Supplies "now" on the application's timeline.
///
/// Demo and test builds run the application clock faster than wall-clock
/// time, so every timestamp the engine compares must come from here.
pub trait AppClock: Send + Sync {
    /// Current application time.
    fn now(&self) -> DateTime<Utc>;

    /// Maps a real-world instant, such as a server timestamp, onto the
    /// application timeline.
    fn application_time(&self, real: DateTime<Utc>) -> DateTime<Utc> {
        real
    }
}

/// The wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl AppClock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: RwLock<DateTime<Utc>>,
}

impl ManualClock {
    /// Creates a clock stopped at `now`.
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: RwLock::new(now),
        }
    }

    /// Sets the current time.
    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.write() = now;
    }

    /// Moves the clock forward.
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.write();
        *now += by;
    }
}

impl AppClock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.read()
    }
}

/// A clock running `rate` times faster than the wall clock from an anchor.
#[derive(Debug, Clone)]
pub struct AcceleratedClock {
    anchor_real: DateTime<Utc>,
    anchor_app: DateTime<Utc>,
    rate: i32,
}

impl AcceleratedClock {
    /// Starts an accelerated clock at the current wall-clock time.
    pub fn new(rate: i32) -> Self {
        let now = Utc::now();
        Self::anchored(now, now, rate)
    }

    /// Creates a clock that reads `anchor_app` at real time `anchor_real`.
    pub fn anchored(anchor_real: DateTime<Utc>, anchor_app: DateTime<Utc>, rate: i32) -> Self {
        Self {
            anchor_real,
            anchor_app,
            rate: rate.max(1),
        }
    }

    /// Acceleration factor.
    pub fn rate(&self) -> i32 {
        self.rate
    }
}

impl AppClock for AcceleratedClock {
    fn now(&self) -> DateTime<Utc> {
        self.application_time(Utc::now())
    }

    fn application_time(&self, real: DateTime<Utc>) -> DateTime<Utc> {
        self.anchor_app + (real - self.anchor_real) * self.rate
    }
}
