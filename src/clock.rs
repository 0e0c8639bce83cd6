//! Injectable time source.
//!
//! Every time-dependent component (timers, buffer expiry, debounce,
//! visibility counters) reads the current instant through a shared
//! [`Clock`] handle instead of calling `Instant::now()` directly, so tests
//! can simulate time without real delays.

use std::cell::Cell;
use std::rc::Rc;
use std::time::{Duration, Instant};

pub type ClockHandle = Rc<dyn Clock>;

pub trait Clock {
    fn now(&self) -> Instant;
}

/// Wall-clock time.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Test clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    base: Instant,
    offset: Cell<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            offset: Cell::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.offset.set(self.offset.get() + by);
    }

    pub fn advance_ms(&self, ms: u64) {
        self.advance(Duration::from_millis(ms));
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + self.offset.get()
    }
}

/// Milliseconds elapsed between `epoch` and `now`, for event variables.
pub fn millis_since(epoch: Instant, now: Instant) -> u64 {
    now.saturating_duration_since(epoch).as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances_only_on_demand() {
        let clock = ManualClock::new();
        let t0 = clock.now();
        assert_eq!(clock.now(), t0);

        clock.advance_ms(250);
        assert_eq!(clock.now() - t0, Duration::from_millis(250));

        clock.advance(Duration::from_secs(2));
        assert_eq!(clock.now() - t0, Duration::from_millis(2250));
    }

    #[test]
    fn millis_since_saturates_backwards() {
        let clock = ManualClock::new();
        let later = clock.now() + Duration::from_secs(1);
        assert_eq!(millis_since(later, clock.now()), 0);
        assert_eq!(millis_since(clock.now(), later), 1000);
    }
}
