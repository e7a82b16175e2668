//! Monotonic cycle counter.

use std::time::Duration;

/// Cycle counter driving all timed behavior of a [`Device`](crate::Device).
///
/// The counter is 64-bit and never decreases except through an explicit
/// device reset. Timer ticking for advanced cycles is done by the device,
/// which advances the clock one cycle at a time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Clock {
    cycles: u64,
}

impl Clock {
    pub fn new() -> Self {
        Clock { cycles: 0 }
    }

    /// Current cycle count.
    #[inline(always)]
    pub fn now(&self) -> u64 {
        self.cycles
    }

    /// Advance by `n` cycles and return the new count.
    #[inline(always)]
    pub fn advance(&mut self, n: u64) -> u64 {
        self.cycles += n;
        self.cycles
    }

    /// Wall time represented by the current count at `clock_hz`.
    pub fn elapsed(&self, clock_hz: u32) -> Duration {
        let hz = clock_hz.max(1) as u128;
        let nanos = self.cycles as u128 * 1_000_000_000 / hz;
        Duration::from_nanos(nanos.min(u64::MAX as u128) as u64)
    }

    pub(crate) fn reset(&mut self) {
        self.cycles = 0;
    }

    pub(crate) fn restore(&mut self, cycles: u64) {
        self.cycles = cycles;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advance_is_monotonic() {
        let mut c = Clock::new();
        assert_eq!(c.now(), 0);
        assert_eq!(c.advance(3), 3);
        assert_eq!(c.advance(0), 3);
        assert_eq!(c.advance(u32::MAX as u64), 3 + u32::MAX as u64);
    }

    #[test]
    fn test_elapsed_at_16mhz() {
        let mut c = Clock::new();
        c.advance(16_000);
        assert_eq!(c.elapsed(16_000_000), Duration::from_millis(1));
    }
}
