//! Single-core cooperative scheduler.
//!
//! Threads are futures.  Exactly one of them runs at a time and control only
//! changes hands at an `.await` on one of the scheduler's suspension points:
//! [`Queue::block`], [`Scheduler::fork`], [`Scheduler::yield_now`],
//! [`Scheduler::sleep`], [`Scheduler::exit`] and the waits inside the
//! [`crate::sync`] primitives.  [`Scheduler::run`] is the executor.
//!
//! Misuse is fatal: unblocking an empty queue, joining a thread twice,
//! running out of runnable threads with no timer pending, or exiting the
//! main thread all panic.

mod queue;
mod runtime;
mod sleep;
mod task_struct;


use alloc::boxed::Box;
use alloc::rc::Rc;
use alloc::vec::Vec;
use core::future::Future;
use core::pin::Pin;

use coopnet_lib::CycleClock;

pub use queue::Queue;
pub use runtime::{Exit, Fork, Park};
pub use task_struct::ThreadState;

use task_struct::{SchedCore, Slot};

pub(crate) type ThreadBody = Pin<Box<dyn Future<Output = ()>>>;

/// A boxed, non-`Send` future borrowing for `'a`.  Used wherever a layer
/// stores an async callback as a plain function pointer.
pub type LocalBoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + 'a>>;

/// Handle of a forked thread, consumed by [`Scheduler::join`] or
/// [`Scheduler::detach`].
///
/// The handle is `Copy` like a C thread id; using it after the thread has
/// been joined is detected and fatal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Thread {
    slot: Slot,
    id: u32,
}

impl Thread {
    pub fn id(&self) -> u32 {
        self.id
    }
}

pub(crate) struct SchedInner {
    pub(crate) core: spin::Mutex<SchedCore>,
    bodies: spin::Mutex<Vec<Option<ThreadBody>>>,
    clock: Rc<dyn CycleClock>,
}

/// Cheaply clonable handle to one scheduler instance.
#[derive(Clone)]
pub struct Scheduler {
    pub(crate) inner: Rc<SchedInner>,
}

impl Scheduler {
    pub fn new(clock: Rc<dyn CycleClock>) -> Self {
        let core = SchedCore::new(clock.cycles(), clock.cycles_per_micro());
        Self {
            inner: Rc::new(SchedInner {
                core: spin::Mutex::new(core),
                bodies: spin::Mutex::new(Vec::new()),
                clock,
            }),
        }
    }

    pub(crate) fn sample_clock(&self, core: &mut SchedCore) {
        core.sample(self.inner.clock.cycles());
    }

    fn install(&self, body: ThreadBody) -> Thread {
        let (slot, id) = self.inner.core.lock().alloc_thread();
        let mut bodies = self.inner.bodies.lock();
        if bodies.len() <= slot {
            bodies.resize_with(slot + 1, || None);
        }
        bodies[slot] = Some(body);
        Thread { slot, id }
    }

    /// Create a thread and put it on the ready queue without switching to
    /// it.  Used to start service threads before or outside [`run`](Self::run).
    pub fn spawn<F>(&self, body: F) -> Thread
    where
        F: Future<Output = ()> + 'static,
    {
        let thread = self.install(Box::pin(body));
        let mut core = self.inner.core.lock();
        let ready = core.ready;
        core.enqueue(ready, thread.slot);
        thread
    }

    /// Create a thread and run it immediately; the caller goes to the back
    /// of the ready queue.
    pub fn fork<F>(&self, body: F) -> Fork
    where
        F: Future<Output = ()> + 'static,
    {
        Fork::new(self.clone(), Box::pin(body))
    }

    /// Terminate the calling thread with `status`.  Never resolves.  A
    /// thread whose body returns exits with status 0.
    pub fn exit(&self, status: i32) -> Exit {
        Exit::new(self.clone(), status)
    }

    /// Wait for `thread` to exit, recycle it and return its status.
    pub async fn join(&self, thread: Thread) -> i32 {
        let wait_on = {
            let mut core = self.inner.core.lock();
            core.check_handle(thread.slot, thread.id, "join");
            let tcb = &mut core.threads[thread.slot];
            if tcb.join_count > 0 {
                tcb.join_count -= 1;
                None
            } else {
                Some(tcb.join_queue)
            }
        };
        if let Some(queue) = wait_on {
            Park::new(self.clone(), queue, 0).await;
        }
        let mut core = self.inner.core.lock();
        core.check_handle(thread.slot, thread.id, "join");
        let status = core.threads[thread.slot].status;
        core.reap(thread.slot);
        status
    }

    /// Give up the right to join `thread`.  A thread that already exited is
    /// recycled at once.
    pub fn detach(&self, thread: Thread) {
        let mut core = self.inner.core.lock();
        core.check_handle(thread.slot, thread.id, "detach");
        let tcb = &mut core.threads[thread.slot];
        tcb.detached = true;
        if tcb.join_count > 0 {
            tcb.join_count -= 1;
            core.reap(thread.slot);
        }
    }

    /// Let every other ready thread run once.  A no-op when nothing else is
    /// ready.
    pub async fn yield_now(&self) {
        let ready = {
            let mut core = self.inner.core.lock();
            self.sample_clock(&mut core);
            core.check_timeout();
            if core.is_empty(core.ready) {
                None
            } else {
                Some(core.ready)
            }
        };
        if let Some(ready) = ready {
            Park::new(self.clone(), ready, 0).await;
        }
    }

    /// Block for `micros` microseconds.  `sleep(0)` is a yield.
    pub async fn sleep(&self, micros: u64) {
        if micros == 0 {
            self.yield_now().await;
            return;
        }
        let queue = Queue::new(self);
        queue.block(micros).await;
    }

    /// Microseconds elapsed since the scheduler was created.
    pub fn now(&self) -> u64 {
        let mut core = self.inner.core.lock();
        self.sample_clock(&mut core);
        core.now / core.rate as u64
    }

    pub fn current(&self) -> Thread {
        let core = self.inner.core.lock();
        let slot = core.running;
        Thread {
            slot,
            id: core.threads[slot].id.unwrap_or(0),
        }
    }

    pub fn state(&self, thread: Thread) -> ThreadState {
        let core = self.inner.core.lock();
        match core.threads.get(thread.slot) {
            Some(tcb) if tcb.id == Some(thread.id) => tcb.state,
            _ => ThreadState::Free,
        }
    }

    /// Number of context switches so far.
    pub fn xfers(&self) -> u64 {
        self.inner.core.lock().xfers
    }

    /// Thread control blocks not yet recycled, the main thread included.
    pub fn live_threads(&self) -> usize {
        self.inner.core.lock().live_threads()
    }

    /// Drop the bodies of every parked thread.  Call once [`run`](Self::run)
    /// has returned to release the resources they hold.
    pub fn shutdown(&self) {
        self.inner.core.lock().shutting_down = true;
        let bodies = core::mem::take(&mut *self.inner.bodies.lock());
        drop(bodies);
    }

    /// Threads left parked forever because their queue was dropped while
    /// the scheduler was still running.
    pub fn stranded(&self) -> u64 {
        self.inner.core.lock().stranded
    }

    pub(crate) fn take_body(&self, slot: Slot) -> Option<ThreadBody> {
        self.inner.bodies.lock().get_mut(slot).and_then(Option::take)
    }

    pub(crate) fn put_body(&self, slot: Slot, body: ThreadBody) {
        let mut bodies = self.inner.bodies.lock();
        if bodies.len() <= slot {
            bodies.resize_with(slot + 1, || None);
        }
        bodies[slot] = Some(body);
    }

    pub(crate) fn clock(&self) -> &dyn CycleClock {
        &*self.inner.clock
    }
}

impl core::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let core = self.inner.core.lock();
        f.debug_struct("Scheduler")
            .field("running", &core.running)
            .field("threads", &core.threads.len())
            .field("xfers", &core.xfers)
            .finish()
    }
}
