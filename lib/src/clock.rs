//! Cycle-counter clocks.
//!
//! The scheduler keeps time by accumulating deltas of a free-running 32-bit
//! cycle counter, so a clock only has to expose the raw counter and its rate.
//! The counter must be sampled at least once per wrap period (about 42 s at
//! 100 MHz); the scheduler samples on every scheduling decision.

use core::cell::Cell;

/// A free-running hardware-style cycle counter.
pub trait CycleClock {
    /// Current counter value.  Wraps at `u32::MAX`.
    fn cycles(&self) -> u32;

    /// Counter rate in cycles per microsecond (the clock frequency in MHz).
    fn cycles_per_micro(&self) -> u32;

    /// Called by the scheduler when no thread is runnable.  `until_deadline`
    /// is the number of cycles until the earliest timer fires.
    fn idle(&self, until_deadline: u64) {
        let _ = until_deadline;
        core::hint::spin_loop();
    }
}

/// Reference cycle rate: 100 MHz.
pub const DEFAULT_CYCLES_PER_MICRO: u32 = 100;

/// Largest single step a [`ManualClock`] takes while idling, kept below half
/// the counter period so that no wrap is ever missed.
const MAX_IDLE_STEP: u64 = 1 << 31;

/// A virtual cycle counter.
///
/// Time only moves when [`ManualClock::advance`] is called or when the
/// scheduler idles, in which case the clock jumps straight to the next timer
/// deadline.  A limit turns a program that would wait forever into a panic.
#[derive(Debug)]
pub struct ManualClock {
    cycles: Cell<u64>,
    rate: u32,
    limit: Cell<Option<u64>>,
}

impl ManualClock {
    pub fn new(cycles_per_micro: u32) -> Self {
        Self {
            cycles: Cell::new(0),
            rate: cycles_per_micro.max(1),
            limit: Cell::new(None),
        }
    }

    /// Panic once the clock passes `micros` of virtual time.
    pub fn with_limit_micros(self, micros: u64) -> Self {
        self.limit.set(Some(micros.saturating_mul(self.rate as u64)));
        self
    }

    pub fn advance_micros(&self, micros: u64) {
        self.advance(micros.saturating_mul(self.rate as u64));
    }

    pub fn advance(&self, cycles: u64) {
        let now = self.cycles.get().saturating_add(cycles);
        if let Some(limit) = self.limit.get() {
            if now > limit {
                panic!(
                    "manual clock: virtual time limit of {} us exceeded",
                    limit / self.rate as u64
                );
            }
        }
        self.cycles.set(now);
    }

    /// Total virtual time elapsed, in microseconds.
    pub fn elapsed_micros(&self) -> u64 {
        self.cycles.get() / self.rate as u64
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(DEFAULT_CYCLES_PER_MICRO)
    }
}

impl CycleClock for ManualClock {
    fn cycles(&self) -> u32 {
        self.cycles.get() as u32
    }

    fn cycles_per_micro(&self) -> u32 {
        self.rate
    }

    fn idle(&self, until_deadline: u64) {
        self.advance(until_deadline.clamp(1, MAX_IDLE_STEP));
    }
}

/// The x86 time-stamp counter as a cycle clock.  The rate must be supplied
/// by the caller (calibrated or taken from configuration).
#[cfg(target_arch = "x86_64")]
#[derive(Clone, Copy, Debug)]
pub struct TscClock {
    rate: u32,
}

#[cfg(target_arch = "x86_64")]
impl TscClock {
    pub const fn new(cycles_per_micro: u32) -> Self {
        Self {
            rate: if cycles_per_micro == 0 { 1 } else { cycles_per_micro },
        }
    }
}

#[cfg(target_arch = "x86_64")]
impl CycleClock for TscClock {
    fn cycles(&self) -> u32 {
        crate::tsc::rdtsc() as u32
    }

    fn cycles_per_micro(&self) -> u32 {
        self.rate
    }
}
