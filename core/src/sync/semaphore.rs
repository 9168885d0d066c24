use core::cell::Cell;

use crate::scheduler::{Queue, Scheduler};

/// Counting semaphore.  The count and the wait queue are never both
/// non-zero.
pub struct Semaphore {
    queue: Queue,
    count: Cell<u32>,
}

impl Semaphore {
    pub fn new(sched: &Scheduler, count: u32) -> Self {
        Self {
            queue: Queue::new(sched),
            count: Cell::new(count),
        }
    }

    /// Take one unit, blocking while none is available.
    pub async fn p(&self) {
        if self.count.get() > 0 {
            self.count.set(self.count.get() - 1);
        } else {
            self.queue.block(0).await;
        }
    }

    /// Take one unit if available without blocking.
    pub fn try_p(&self) -> bool {
        if self.count.get() > 0 {
            self.count.set(self.count.get() - 1);
            true
        } else {
            false
        }
    }

    /// Release one unit: wake a waiter if there is one, else count it.
    pub fn v(&self) {
        if self.queue.is_empty() {
            self.count.set(self.count.get() + 1);
        } else {
            self.queue.unblock();
        }
    }

    pub fn count(&self) -> u32 {
        self.count.get()
    }

    pub fn has_waiters(&self) -> bool {
        !self.queue.is_empty()
    }
}
