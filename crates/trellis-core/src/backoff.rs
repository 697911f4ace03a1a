//! Capped exponential backoff.
//!
//! Used by watch supervision and persistence retry loops. Deterministic (no
//! jitter) so schedules can be asserted in tests.

use std::time::Duration;

/// Default base delay.
pub const BACKOFF_BASE: Duration = Duration::from_millis(500);

/// Default delay cap.
pub const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// A capped exponential backoff schedule.
///
/// Each call to [`Backoff::next`] returns the current delay and doubles it,
/// saturating at the cap. [`Backoff::reset`] restarts the schedule after a
/// success.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    current: Duration,
}

impl Backoff {
    /// Creates a backoff schedule with the given base and cap.
    #[must_use]
    pub const fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            current: base,
        }
    }

    /// Returns the next delay and advances the schedule.
    pub fn next(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.cap);
        delay
    }

    /// Restarts the schedule from the base delay.
    pub fn reset(&mut self) {
        self.current = self.base;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(BACKOFF_BASE, BACKOFF_CAP)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_until_cap() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(450));
        assert_eq!(backoff.next(), Duration::from_millis(100));
        assert_eq!(backoff.next(), Duration::from_millis(200));
        assert_eq!(backoff.next(), Duration::from_millis(400));
        assert_eq!(backoff.next(), Duration::from_millis(450));
        assert_eq!(backoff.next(), Duration::from_millis(450));
    }

    #[test]
    fn reset_restarts_schedule() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(1));
        backoff.next();
        backoff.next();
        backoff.reset();
        assert_eq!(backoff.next(), Duration::from_millis(100));
    }
}
