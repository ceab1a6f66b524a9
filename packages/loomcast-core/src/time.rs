//! Time units and rate accumulators.
//!
//! All timestamps and durations in the library are expressed in ticks of
//! 100 nanoseconds, matching the resolution of the ingestion service wire
//! protocol. The host supplies wall-clock readings through [`Clock`];
//! the library never reads the system clock directly.

use std::time::SystemTime;

/// One tick is 100 nanoseconds.
pub type Ticks = u64;

/// Ticks per microsecond.
pub const TICKS_PER_MICROSECOND: Ticks = 10;

/// Ticks per millisecond.
pub const TICKS_PER_MILLISECOND: Ticks = 10_000;

/// Ticks per second.
pub const TICKS_PER_SECOND: Ticks = 10_000_000;

/// Ticks per minute.
pub const TICKS_PER_MINUTE: Ticks = 60 * TICKS_PER_SECOND;

/// Ticks per hour.
pub const TICKS_PER_HOUR: Ticks = 60 * TICKS_PER_MINUTE;

/// Converts a tick duration to whole milliseconds.
#[must_use]
pub const fn ticks_to_millis(ticks: Ticks) -> u64 {
    ticks / TICKS_PER_MILLISECOND
}

/// Converts a tick duration to a `std::time::Duration`.
#[must_use]
pub const fn ticks_to_duration(ticks: Ticks) -> std::time::Duration {
    std::time::Duration::from_nanos(ticks * 100)
}

/// Source of the current time, in ticks since the Unix epoch.
///
/// Host-provided so embedded integrations can substitute a hardware clock
/// and tests can run on a virtual timeline.
pub trait Clock: Send + Sync {
    /// Returns the current time in ticks.
    fn now(&self) -> Ticks;
}

/// Default clock backed by [`SystemTime`].
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Ticks {
        SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| (d.as_nanos() / 100) as Ticks)
            .unwrap_or(0)
    }
}

/// Smoothing factor for the exponential moving averages kept in the stream
/// diagnostics (frame rate, transfer rate, call latency).
const EMA_ALPHA: f64 = 0.2;

/// Feeds the next sample into an exponential moving average.
#[must_use]
pub fn ema_next(accumulator: f64, sample: f64) -> f64 {
    EMA_ALPHA * sample + (1.0 - EMA_ALPHA) * accumulator
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_conversions() {
        assert_eq!(ticks_to_millis(TICKS_PER_SECOND), 1000);
        assert_eq!(ticks_to_duration(TICKS_PER_MILLISECOND).as_millis(), 1);
    }

    #[test]
    fn ema_converges_toward_samples() {
        let mut acc = 0.0;
        for _ in 0..100 {
            acc = ema_next(acc, 30.0);
        }
        assert!((acc - 30.0).abs() < 0.1);
    }

    #[test]
    fn system_clock_is_monotonic_enough() {
        let clock = SystemClock;
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }
}
