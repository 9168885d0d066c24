//! The executor and the futures behind every suspension point.

use core::convert::Infallible;
use core::future::Future;
use core::pin::{Pin, pin};
use core::task::{Context, Poll, Waker};

use coopnet_lib::klog_trace;

use super::task_struct::{MAIN_SLOT, QueueId, Slot, ThreadState};
use super::{Scheduler, Thread, ThreadBody};

impl Scheduler {
    /// Run `main` as the initial thread (id 0) until it completes, switching
    /// to other threads whenever it blocks.
    ///
    /// Threads still parked when `main` returns stay parked; call
    /// [`shutdown`](Self::shutdown) to drop them.
    pub fn run<F: Future>(&self, main: F) -> F::Output {
        let mut main = pin!(main);
        let mut cx = Context::from_waker(Waker::noop());
        let mut slot = MAIN_SLOT;

        loop {
            self.inner.core.lock().switch_to(slot);

            if slot == MAIN_SLOT {
                if let Poll::Ready(output) = main.as_mut().poll(&mut cx) {
                    return output;
                }
                let state = self.inner.core.lock().threads[MAIN_SLOT].state;
                if state == ThreadState::Terminated {
                    panic!("sched: the main thread called exit");
                }
            } else {
                self.poll_thread(slot, &mut cx);
            }

            let handoff = {
                let mut core = self.inner.core.lock();
                core.requeue_if_loose(slot);
                core.handoff.take()
            };
            slot = match handoff {
                Some(child) => child,
                None => self.pick_next(),
            };
        }
    }

    fn poll_thread(&self, slot: Slot, cx: &mut Context<'_>) {
        let Some(mut body) = self.take_body(slot) else {
            panic!("sched: thread slot {} scheduled without a body", slot);
        };
        match body.as_mut().poll(cx) {
            Poll::Ready(()) => {
                self.inner.core.lock().exit_running(0);
                drop(body);
            }
            Poll::Pending => {
                let state = self.inner.core.lock().threads[slot].state;
                if state == ThreadState::Terminated || state == ThreadState::Free {
                    drop(body);
                } else {
                    self.put_body(slot, body);
                }
            }
        }
    }

    /// Wait (idling the clock) until some thread is ready and dequeue it.
    fn pick_next(&self) -> Slot {
        loop {
            let idle_for = {
                let mut core = self.inner.core.lock();
                self.sample_clock(&mut core);
                core.check_timeout();
                let ready = core.ready;
                if let Some(next) = core.dequeue(ready) {
                    return next;
                }
                core.next_deadline()
            };
            match idle_for {
                Some(cycles) => self.clock().idle(cycles),
                None => panic!("sched: deadlock, every thread is blocked and no timer is pending"),
            }
        }
    }
}

/// Suspension of the running thread on a wait queue.
///
/// The first poll parks the thread (and arms its timer when `micros > 0`);
/// the poll after it has been made ready again resolves to whether the
/// wakeup came from the timer.
pub struct Park {
    sched: Scheduler,
    queue: QueueId,
    micros: u64,
    parked: bool,
}

impl Park {
    pub(crate) fn new(sched: Scheduler, queue: QueueId, micros: u64) -> Self {
        Self {
            sched,
            queue,
            micros,
            parked: false,
        }
    }
}

impl Future for Park {
    type Output = bool;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<bool> {
        let this = self.get_mut();
        let mut core = this.sched.inner.core.lock();
        if this.parked {
            let running = core.running;
            return Poll::Ready(core.threads[running].timed_out);
        }
        this.sched.sample_clock(&mut core);
        core.park_running(this.queue, this.micros);
        this.parked = true;
        Poll::Pending
    }
}

/// Future returned by [`Scheduler::fork`].
pub struct Fork {
    sched: Scheduler,
    body: Option<ThreadBody>,
    child: Option<Thread>,
}

impl Fork {
    pub(crate) fn new(sched: Scheduler, body: ThreadBody) -> Self {
        Self {
            sched,
            body: Some(body),
            child: None,
        }
    }
}

impl Future for Fork {
    type Output = Thread;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Thread> {
        let this = self.get_mut();
        if let Some(child) = this.child {
            return Poll::Ready(child);
        }
        let Some(body) = this.body.take() else {
            panic!("sched: fork polled after completion");
        };
        let child = this.sched.install(body);
        let mut core = this.sched.inner.core.lock();
        let (ready, running) = (core.ready, core.running);
        core.enqueue(ready, running);
        core.threads[running].state = ThreadState::Ready;
        core.handoff = Some(child.slot);
        klog_trace!("sched: thread {} forked {}", core.threads[running].id.unwrap_or(0), child.id);
        this.child = Some(child);
        Poll::Pending
    }
}

/// Future returned by [`Scheduler::exit`].  Never resolves: the executor
/// drops the thread's body once it has terminated.
pub struct Exit {
    sched: Scheduler,
    status: i32,
    done: bool,
}

impl Exit {
    pub(crate) fn new(sched: Scheduler, status: i32) -> Self {
        Self {
            sched,
            status,
            done: false,
        }
    }
}

impl Future for Exit {
    type Output = Infallible;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Infallible> {
        let this = self.get_mut();
        if !this.done {
            this.done = true;
            this.sched.inner.core.lock().exit_running(this.status);
        }
        Poll::Pending
    }
}
