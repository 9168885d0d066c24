//! Blocking synchronization built on [`Queue`](crate::scheduler::Queue).
//!
//! All three primitives hand ownership straight to a waiter when one
//! exists: a `v()` or an unlock with a parked thread wakes it instead of
//! bumping the count or clearing the lock, so a woken thread never has to
//! re-check.

mod condition;
mod mutex;
mod semaphore;


pub use condition::Condition;
pub use mutex::{Mutex, MutexGuard};
pub use semaphore::Semaphore;
