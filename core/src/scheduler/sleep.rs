//! Timer queue.
//!
//! Threads blocked with a timeout are additionally linked on a doubly-linked
//! list through `tq_prev`/`tq_next`, so an explicit unblock removes them in
//! O(1).  The list is unordered; wakeups are found by a full scan, which is
//! cheap for the handful of timed waiters a stack has at once.

use super::task_struct::{SchedCore, Slot};

/// Whether `deadline` has been reached at `now` (both in cycles).
#[inline]
pub(crate) fn tick_reached(now: u64, deadline: u64) -> bool {
    now >= deadline
}

impl SchedCore {
    /// Fold the elapsed cycles since the previous sample into `now`.  The
    /// counter is 32 bits wide, so samples must be less than one wrap apart.
    pub fn sample(&mut self, cycles: u32) {
        self.now += cycles.wrapping_sub(self.last_cycles) as u64;
        self.last_cycles = cycles;
    }

    pub fn tq_insert(&mut self, t: Slot, wakeup: u64) {
        debug_assert!(wakeup != 0);
        self.threads[t].wakeup = wakeup;
        self.threads[t].tq_next = None;
        self.threads[t].tq_prev = self.tq_tail;
        match self.tq_tail {
            Some(tail) => self.threads[tail].tq_next = Some(t),
            None => self.tq_head = Some(t),
        }
        self.tq_tail = Some(t);
    }

    /// Remove `t` from the timer queue; a no-op if it is not on it.
    pub fn tq_remove(&mut self, t: Slot) {
        if self.threads[t].wakeup == 0 {
            return;
        }
        let prev = self.threads[t].tq_prev.take();
        let next = self.threads[t].tq_next.take();
        match prev {
            Some(p) => self.threads[p].tq_next = next,
            None => self.tq_head = next,
        }
        match next {
            Some(n) => self.threads[n].tq_prev = prev,
            None => self.tq_tail = prev,
        }
        self.threads[t].wakeup = 0;
    }

    /// Wake every thread whose deadline has passed: it leaves its wait
    /// queue, is flagged as timed out and goes to the ready queue.
    pub fn check_timeout(&mut self) {
        let mut cursor = self.tq_head;
        while let Some(t) = cursor {
            cursor = self.threads[t].tq_next;
            if tick_reached(self.now, self.threads[t].wakeup) {
                self.dequeue_one(t);
                self.threads[t].timed_out = true;
                self.make_ready(t);
            }
        }
    }

    /// Cycles until the earliest pending wakeup, or `None` with no timers.
    pub fn next_deadline(&self) -> Option<u64> {
        let mut cursor = self.tq_head;
        let mut earliest: Option<u64> = None;
        while let Some(t) = cursor {
            let wakeup = self.threads[t].wakeup;
            earliest = Some(earliest.map_or(wakeup, |e| e.min(wakeup)));
            cursor = self.threads[t].tq_next;
        }
        earliest.map(|w| w.saturating_sub(self.now))
    }
}
