use super::runtime::Park;
use super::task_struct::QueueId;
use super::Scheduler;

/// A FIFO of blocked threads, the building block of every wait in the
/// system.
///
/// Blocking and unblocking involve no lock of their own: with cooperative
/// scheduling nothing can run between a caller's check of some condition
/// and its `block().await`, so wakeups are never lost.
pub struct Queue {
    sched: Scheduler,
    id: QueueId,
}

impl Queue {
    pub fn new(sched: &Scheduler) -> Self {
        let id = sched.inner.core.lock().alloc_queue();
        Self {
            sched: sched.clone(),
            id,
        }
    }

    /// Park the calling thread at the tail of the queue.  With `micros > 0`
    /// the thread is also woken when the timeout expires.  Resolves to
    /// `true` if the wakeup came from the timeout.
    pub fn block(&self, micros: u64) -> Park {
        Park::new(self.sched.clone(), self.id, micros)
    }

    /// Move the head of the queue to the ready queue.  Does not switch.
    ///
    /// # Panics
    ///
    /// If the queue is empty.
    pub fn unblock(&self) {
        self.sched.inner.core.lock().unblock(self.id);
    }

    pub fn is_empty(&self) -> bool {
        self.sched.inner.core.lock().is_empty(self.id)
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.sched
    }
}

impl Drop for Queue {
    fn drop(&mut self) {
        self.sched.inner.core.lock().free_queue(self.id);
    }
}

impl core::fmt::Debug for Queue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Queue")
            .field("id", &self.id)
            .field("empty", &self.is_empty())
            .finish()
    }
}
