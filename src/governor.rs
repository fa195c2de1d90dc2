//! Sleep-interval governor.
//!
//! Computes the duration of the next sleep. Idle wake cycles double the
//! interval (up to `interval_max`); productive cycles reset it to
//! `interval_min`, so idle nodes become rare wakers while busy nodes stay
//! responsive.
//!
//! The shift is an atomic because the timer path reads the current interval
//! while the worker mutates it: a lock-free single-writer / reader split in
//! place of briefly disabling interrupts.

use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

/// Exponential back-off governor for the sleep interval.
///
/// Effective interval is `interval_min << shift`, clamped at `interval_max`.
pub struct IntervalGovernor {
    shift: AtomicU8,
    min_ms: u64,
    max_ms: u64,
}

impl IntervalGovernor {
    /// Create a governor over the `[min, max]` interval range.
    ///
    /// `max` is expected to be `min << k` for some `k <= 31`; the config
    /// layer validates this before construction.
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            shift: AtomicU8::new(0),
            min_ms: min.as_millis() as u64,
            max_ms: max.as_millis() as u64,
        }
    }

    /// The current sleep interval.
    pub fn current(&self) -> Duration {
        let shift = self.shift.load(Ordering::Acquire) as u32;
        let ms = if shift >= u64::BITS || self.min_ms.leading_zeros() < shift {
            self.max_ms
        } else {
            (self.min_ms << shift).min(self.max_ms)
        };
        Duration::from_millis(ms)
    }

    /// Double the interval after an empty cycle.
    ///
    /// The shift only advances while the doubled interval neither overflows
    /// nor exceeds the cap; past that, back-off is a no-op.
    pub fn backoff(&self) {
        let shift = self.shift.load(Ordering::Acquire);
        let doubled = shift as u32 + 1;
        if doubled >= u64::BITS || self.min_ms.leading_zeros() < doubled {
            return;
        }
        if self.min_ms << shift >= self.max_ms {
            return;
        }
        self.shift.store(shift + 1, Ordering::Release);
    }

    /// Return to the minimum interval after a productive cycle.
    pub fn reset(&self) {
        self.shift.store(0, Ordering::Release);
    }

    /// The current shift, for diagnostics.
    pub fn shift(&self) -> u8 {
        self.shift.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn governor() -> IntervalGovernor {
        IntervalGovernor::new(Duration::from_millis(100), Duration::from_millis(1600))
    }

    #[test]
    fn test_starts_at_minimum() {
        let gov = governor();
        assert_eq!(gov.shift(), 0);
        assert_eq!(gov.current(), Duration::from_millis(100));
    }

    #[test]
    fn test_backoff_doubles() {
        let gov = governor();
        gov.backoff();
        assert_eq!(gov.current(), Duration::from_millis(200));
        gov.backoff();
        assert_eq!(gov.current(), Duration::from_millis(400));
    }

    #[test]
    fn test_backoff_monotonic_until_cap() {
        let gov = governor();
        let mut last = gov.current();
        for _ in 0..10 {
            gov.backoff();
            let next = gov.current();
            assert!(next >= last);
            assert!(next <= Duration::from_millis(1600));
            last = next;
        }
        assert_eq!(gov.current(), Duration::from_millis(1600));
    }

    #[test]
    fn test_backoff_stops_at_cap() {
        let gov = governor();
        for _ in 0..4 {
            gov.backoff();
        }
        assert_eq!(gov.current(), Duration::from_millis(1600));
        let shift_at_cap = gov.shift();
        gov.backoff();
        assert_eq!(gov.shift(), shift_at_cap);
        assert_eq!(gov.current(), Duration::from_millis(1600));
    }

    #[test]
    fn test_reset_returns_to_minimum() {
        let gov = governor();
        gov.backoff();
        gov.backoff();
        gov.reset();
        assert_eq!(gov.shift(), 0);
        assert_eq!(gov.current(), Duration::from_millis(100));
    }

    #[test]
    fn test_consecutive_cycles_double_or_hold() {
        // interval_{n+1} is either interval_n or 2 * interval_n
        let gov = governor();
        let mut prev = gov.current();
        for _ in 0..8 {
            gov.backoff();
            let cur = gov.current();
            assert!(cur == prev || cur == prev * 2, "{:?} after {:?}", cur, prev);
            prev = cur;
        }
    }

    #[test]
    fn test_degenerate_equal_min_max() {
        let gov = IntervalGovernor::new(Duration::from_millis(100), Duration::from_millis(100));
        gov.backoff();
        assert_eq!(gov.shift(), 0);
        assert_eq!(gov.current(), Duration::from_millis(100));
    }
}
