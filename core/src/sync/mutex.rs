use core::cell::{Cell, UnsafeCell};
use core::ops::{Deref, DerefMut};

use crate::scheduler::{Queue, Scheduler};

/// Binary, non-reentrant blocking mutex owning its data.
///
/// Locking it again from the thread that holds it deadlocks that thread.
/// The guard may be held across `.await`; other threads that try to lock
/// park until it is dropped.
pub struct Mutex<T> {
    queue: Queue,
    unlocked: Cell<bool>,
    data: UnsafeCell<T>,
}

impl<T> Mutex<T> {
    pub fn new(sched: &Scheduler, data: T) -> Self {
        Self {
            queue: Queue::new(sched),
            unlocked: Cell::new(true),
            data: UnsafeCell::new(data),
        }
    }

    pub async fn lock(&self) -> MutexGuard<'_, T> {
        self.acquire().await;
        MutexGuard { mutex: self }
    }

    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        if self.unlocked.get() {
            self.unlocked.set(false);
            Some(MutexGuard { mutex: self })
        } else {
            None
        }
    }

    pub fn is_locked(&self) -> bool {
        !self.unlocked.get()
    }

    pub(crate) async fn acquire(&self) {
        if self.unlocked.get() {
            self.unlocked.set(false);
        } else {
            self.queue.block(0).await;
        }
    }

    /// Hand the lock to the first waiter, or mark it free.
    pub(crate) fn release(&self) {
        if self.queue.is_empty() {
            self.unlocked.set(true);
        } else {
            self.queue.unblock();
        }
    }
}

pub struct MutexGuard<'a, T> {
    pub(crate) mutex: &'a Mutex<T>,
}

impl<T> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: a guard exists only while the mutex is held, and the
        // mutex is never shared across OS threads.
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: as in `deref`, and `&mut self` makes this the only access.
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.release();
    }
}
