//! Thread control blocks and the intrusive queues that link them.
//!
//! Every thread lives in one slot of `SchedCore::threads`.  Queues do not
//! own threads: a queue is a head/tail pair of slot indices, and each TCB
//! carries the `next` link for the one queue it is on plus the `tq_prev` /
//! `tq_next` links of the timer queue.  All of it sits behind the
//! scheduler's spin lock, which is never held across a suspension point.

use alloc::vec::Vec;

use coopnet_lib::{klog_debug, klog_warn};

/// Index of a TCB in the thread arena.
pub(crate) type Slot = usize;

/// The thread that called [`Scheduler::run`](super::Scheduler::run).
pub(crate) const MAIN_SLOT: Slot = 0;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadState {
    Ready,
    Running,
    Blocked,
    /// Exited, waiting to be joined or detached.
    Terminated,
    /// Recycled onto the dead list.
    Free,
}

impl ThreadState {
    pub fn name(self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Blocked => "blocked",
            Self::Terminated => "terminated",
            Self::Free => "free",
        }
    }
}

/// Handle of a wait queue in the queue arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct QueueId(u32);

#[derive(Default)]
struct QueueList {
    head: Option<Slot>,
    tail: Option<Slot>,
    live: bool,
}

pub(crate) struct Tcb {
    /// Unique id, `None` once the TCB has been joined and recycled.
    pub id: Option<u32>,
    pub state: ThreadState,
    /// The wait (or ready) queue this thread is linked on.
    pub queue: Option<QueueId>,
    pub next: Option<Slot>,
    /// Absolute wakeup time in cycles; 0 when not on the timer queue.
    pub wakeup: u64,
    pub tq_prev: Option<Slot>,
    pub tq_next: Option<Slot>,
    pub timed_out: bool,
    pub status: i32,
    pub detached: bool,
    /// Join semaphore: waiters block on `join_queue`, an exit with no
    /// waiter is remembered in `join_count`.
    pub join_queue: QueueId,
    pub join_count: u32,
}

impl Tcb {
    fn new(id: u32, join_queue: QueueId) -> Self {
        Self {
            id: Some(id),
            state: ThreadState::Ready,
            queue: None,
            next: None,
            wakeup: 0,
            tq_prev: None,
            tq_next: None,
            timed_out: false,
            status: 0,
            detached: false,
            join_queue,
            join_count: 0,
        }
    }
}

pub(crate) struct SchedCore {
    pub threads: Vec<Tcb>,
    queues: Vec<QueueList>,
    free_queues: Vec<u32>,
    pub ready: QueueId,
    /// Recycled TCBs, reused by the next fork.
    pub dead: QueueId,
    pub(super) tq_head: Option<Slot>,
    pub(super) tq_tail: Option<Slot>,
    pub running: Slot,
    /// Set by fork: the child runs before anything else.
    pub handoff: Option<Slot>,
    pub fork_count: u32,
    pub xfers: u64,
    /// Accumulated cycles since the scheduler was created.
    pub now: u64,
    pub(super) last_cycles: u32,
    pub rate: u32,
    /// Threads left parked on a queue that was dropped outside shutdown.
    pub stranded: u64,
    /// Thread bodies are being dropped; their queues go with them.
    pub shutting_down: bool,
}

impl SchedCore {
    pub fn new(start_cycles: u32, rate: u32) -> Self {
        let mut core = Self {
            threads: Vec::new(),
            queues: Vec::new(),
            free_queues: Vec::new(),
            ready: QueueId(0),
            dead: QueueId(0),
            tq_head: None,
            tq_tail: None,
            running: MAIN_SLOT,
            handoff: None,
            fork_count: 0,
            xfers: 0,
            now: 0,
            last_cycles: start_cycles,
            rate: rate.max(1),
            stranded: 0,
            shutting_down: false,
        };
        core.ready = core.alloc_queue();
        core.dead = core.alloc_queue();
        let join = core.alloc_queue();
        let mut main = Tcb::new(0, join);
        main.state = ThreadState::Running;
        core.threads.push(main);
        core
    }

    // =========================================================================
    // Queue arena
    // =========================================================================

    pub fn alloc_queue(&mut self) -> QueueId {
        match self.free_queues.pop() {
            Some(idx) => {
                self.queues[idx as usize] = QueueList {
                    live: true,
                    ..QueueList::default()
                };
                QueueId(idx)
            }
            None => {
                self.queues.push(QueueList {
                    live: true,
                    ..QueueList::default()
                });
                QueueId(self.queues.len() as u32 - 1)
            }
        }
    }

    /// Release a queue.  Threads still parked on it are unlinked and left
    /// blocked; this only happens while the owning structure is being torn
    /// down.
    pub fn free_queue(&mut self, q: QueueId) {
        let mut stranded = 0;
        while let Some(t) = self.dequeue(q) {
            self.tq_remove(t);
            stranded += 1;
        }
        if stranded > 0 && self.shutting_down {
            klog_debug!("sched: shutdown released {} parked threads", stranded);
        } else if stranded > 0 {
            self.stranded += stranded;
            klog_warn!("sched: queue dropped with {} parked threads", stranded);
        }
        self.queues[q.0 as usize].live = false;
        self.free_queues.push(q.0);
    }

    fn list(&mut self, q: QueueId) -> &mut QueueList {
        let list = &mut self.queues[q.0 as usize];
        assert!(list.live, "sched: use of a freed queue");
        list
    }

    pub fn is_empty(&self, q: QueueId) -> bool {
        self.queues[q.0 as usize].head.is_none()
    }

    /// Append `t` to the tail of `q`.
    pub fn enqueue(&mut self, q: QueueId, t: Slot) {
        debug_assert!(self.threads[t].queue.is_none(), "thread already queued");
        self.threads[t].queue = Some(q);
        self.threads[t].next = None;
        let prev_tail = self.list(q).tail;
        match prev_tail {
            Some(tail) => self.threads[tail].next = Some(t),
            None => self.list(q).head = Some(t),
        }
        self.list(q).tail = Some(t);
    }

    /// Remove and return the head of `q`.
    pub fn dequeue(&mut self, q: QueueId) -> Option<Slot> {
        let head = self.list(q).head?;
        let next = self.threads[head].next.take();
        let list = self.list(q);
        list.head = next;
        if next.is_none() {
            list.tail = None;
        }
        self.threads[head].queue = None;
        Some(head)
    }

    /// Unlink `t` from whatever queue it is on, wherever it sits.
    pub fn dequeue_one(&mut self, t: Slot) {
        let Some(q) = self.threads[t].queue else {
            return;
        };
        let mut prev: Option<Slot> = None;
        let mut cursor = self.list(q).head;
        while let Some(c) = cursor {
            if c == t {
                let next = self.threads[t].next.take();
                match prev {
                    Some(p) => self.threads[p].next = next,
                    None => self.list(q).head = next,
                }
                if self.list(q).tail == Some(t) {
                    self.list(q).tail = prev;
                }
                self.threads[t].queue = None;
                return;
            }
            prev = Some(c);
            cursor = self.threads[c].next;
        }
        panic!("sched: thread slot {} not found on its queue", t);
    }

    // =========================================================================
    // Thread lifecycle
    // =========================================================================

    /// Take `t` off the timer queue (if present) and put it on ready.
    pub fn make_ready(&mut self, t: Slot) {
        self.tq_remove(t);
        self.enqueue(self.ready, t);
        self.threads[t].state = ThreadState::Ready;
    }

    /// Wake the head of `q`.  Unblocking an empty queue is a programming
    /// error.
    pub fn unblock(&mut self, q: QueueId) {
        let Some(t) = self.dequeue(q) else {
            panic!("sched: unblock on an empty queue");
        };
        self.make_ready(t);
    }

    /// Park the running thread on `q`, optionally with a timeout.
    pub fn park_running(&mut self, q: QueueId, micros: u64) {
        let t = self.running;
        self.enqueue(q, t);
        self.threads[t].state = if q == self.ready {
            ThreadState::Ready
        } else {
            ThreadState::Blocked
        };
        self.threads[t].timed_out = false;
        if micros > 0 {
            let wakeup = self.now.saturating_add((self.rate as u64).saturating_mul(micros));
            self.tq_insert(t, wakeup);
        }
    }

    pub fn switch_to(&mut self, t: Slot) {
        if self.running != t {
            self.xfers += 1;
        }
        self.running = t;
        self.threads[t].state = ThreadState::Running;
    }

    /// A thread that went pending without parking anywhere is runnable again.
    pub fn requeue_if_loose(&mut self, t: Slot) {
        let tcb = &self.threads[t];
        if tcb.queue.is_none() && tcb.state == ThreadState::Running {
            self.enqueue(self.ready, t);
            self.threads[t].state = ThreadState::Ready;
        }
    }

    /// Allocate a TCB for a new thread, recycling a dead one if possible.
    pub fn alloc_thread(&mut self) -> (Slot, u32) {
        self.fork_count += 1;
        let id = self.fork_count;
        match self.dequeue(self.dead) {
            Some(slot) => {
                let join = self.threads[slot].join_queue;
                self.threads[slot] = Tcb::new(id, join);
                (slot, id)
            }
            None => {
                let join = self.alloc_queue();
                self.threads.push(Tcb::new(id, join));
                (self.threads.len() - 1, id)
            }
        }
    }

    /// Record the exit of the running thread and signal its joiner.
    pub fn exit_running(&mut self, status: i32) {
        let t = self.running;
        self.threads[t].status = status;
        self.threads[t].state = ThreadState::Terminated;
        let join = self.threads[t].join_queue;
        if self.is_empty(join) {
            self.threads[t].join_count += 1;
        } else {
            self.unblock(join);
        }
        if self.threads[t].detached {
            self.threads[t].join_count = self.threads[t].join_count.saturating_sub(1);
            self.reap(t);
        }
    }

    /// Invalidate a joined thread and push it on the dead list.  The main
    /// thread is never recycled.
    pub fn reap(&mut self, t: Slot) {
        if t == MAIN_SLOT {
            return;
        }
        self.threads[t].id = None;
        self.threads[t].state = ThreadState::Free;
        self.enqueue(self.dead, t);
    }

    /// Panic unless `slot` still holds the thread with `id`.
    pub fn check_handle(&self, slot: Slot, id: u32, op: &str) {
        let live = self.threads.get(slot).and_then(|tcb| tcb.id);
        if live != Some(id) {
            panic!("sched: {} of thread {} which was already joined or recycled", op, id);
        }
    }

    pub fn live_threads(&self) -> usize {
        self.threads.iter().filter(|tcb| tcb.id.is_some()).count()
    }
}
