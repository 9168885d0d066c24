//! Cooperative threads and their synchronization primitives.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod scheduler;
pub mod sync;

pub use scheduler::{LocalBoxFuture, Queue, Scheduler, Thread, ThreadState};
pub use sync::{Condition, Mutex, MutexGuard, Semaphore};
