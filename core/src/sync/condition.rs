use core::mem;

use super::mutex::MutexGuard;
use crate::scheduler::{Queue, Scheduler};

/// Condition variable: a bare queue of waiters.
///
/// Releasing the mutex and parking happen in the same poll, so no other
/// thread can slip in between.
pub struct Condition {
    queue: Queue,
}

impl Condition {
    pub fn new(sched: &Scheduler) -> Self {
        Self {
            queue: Queue::new(sched),
        }
    }

    pub async fn wait<'a, T>(&self, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
        self.timed_wait(guard, 0).await.0
    }

    /// Wait for a signal for at most `micros` (0 waits forever).  Returns the
    /// reacquired guard and whether the wait timed out.
    pub async fn timed_wait<'a, T>(
        &self,
        guard: MutexGuard<'a, T>,
        micros: u64,
    ) -> (MutexGuard<'a, T>, bool) {
        let mutex = guard.mutex;
        mem::forget(guard);
        mutex.release();
        let timed_out = self.queue.block(micros).await;
        mutex.acquire().await;
        (MutexGuard { mutex }, timed_out)
    }

    /// Wake one waiter, if any.
    pub fn signal(&self) {
        if !self.queue.is_empty() {
            self.queue.unblock();
        }
    }

    /// Wake every waiter.
    pub fn broadcast(&self) {
        while !self.queue.is_empty() {
            self.queue.unblock();
        }
    }

    pub fn has_waiters(&self) -> bool {
        !self.queue.is_empty()
    }
}
