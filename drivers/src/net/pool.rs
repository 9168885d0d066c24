//! Packet buffer pool.
//!
//! Buffers are fixed-size, 32-byte aligned slots kept on a free list behind
//! the pool's own spin lock.  The pool never runs dry: when the free list is
//! empty it grows by [`POOL_GROW`] slots, so allocation always succeeds.
//! Freed slots are not cleared.

use alloc::boxed::Box;
use alloc::rc::Rc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

use coopnet_lib::klog_debug;

use super::packetbuf::PacketBuf;

/// Size of each packet buffer in bytes: one IP packet of up to
/// [`super::ENET_PAYLOAD_SIZE`] bytes, rounded up to a multiple of the
/// alignment.
pub const BUF_SIZE: usize = 1536;

/// Slots added each time the free list runs out.
pub const POOL_GROW: usize = 100;

/// Cache-line alignment of every slot.
pub const CACHE_LINE_ALIGN: usize = 32;

#[repr(C, align(32))]
pub(crate) struct Slot {
    pub(crate) data: [u8; BUF_SIZE],
}

const _: () = assert!(core::mem::align_of::<Slot>() == CACHE_LINE_ALIGN);

impl Slot {
    fn new_boxed() -> Box<Self> {
        Box::new(Slot {
            data: [0u8; BUF_SIZE],
        })
    }
}

pub struct PacketPool {
    free: spin::Mutex<Vec<Box<Slot>>>,
    total: AtomicUsize,
}

impl PacketPool {
    pub fn new() -> Rc<Self> {
        Rc::new(Self {
            free: spin::Mutex::new(Vec::new()),
            total: AtomicUsize::new(0),
        })
    }

    /// Take a buffer from the pool, growing it if it is empty.  The contents
    /// are whatever the previous user left behind; the length starts at 0.
    pub fn alloc(self: &Rc<Self>) -> PacketBuf {
        let slot = {
            let mut free = self.free.lock();
            if free.is_empty() {
                free.extend((0..POOL_GROW).map(|_| Slot::new_boxed()));
                let total = self.total.fetch_add(POOL_GROW, Ordering::Relaxed) + POOL_GROW;
                klog_debug!("pool: grew to {} buffers", total);
            }
            free.pop()
        };
        PacketBuf::from_slot(slot.unwrap_or_else(Slot::new_boxed), self.clone())
    }

    /// Return a slot to the free list.  Called by `PacketBuf::drop`.
    pub(crate) fn release(&self, slot: Box<Slot>) {
        self.free.lock().push(slot);
    }

    /// Number of free buffers.
    pub fn available(&self) -> usize {
        self.free.lock().len()
    }

    /// Number of buffers ever created by this pool.
    pub fn total(&self) -> usize {
        self.total.load(Ordering::Relaxed)
    }

    /// Buffers currently owned by someone.
    pub fn in_use(&self) -> usize {
        self.total().saturating_sub(self.available())
    }
}
