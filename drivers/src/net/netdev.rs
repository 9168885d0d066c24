//! Network device abstraction: the [`NetDevice`] trait and the receive
//! queue a device feeds.
//!
//! A device moves Ethernet payloads; the link header travels alongside the
//! buffer as plain fields.  Transmission is synchronous.  Reception is
//! asynchronous: the device copies each frame into a [`PacketBuf`] from the
//! stack's pool and pushes it onto the stack's [`RxQueue`], which wakes the
//! stack's deliver thread.  Nothing on the receive path runs protocol code
//! inside the device.

use alloc::collections::VecDeque;
use alloc::rc::Rc;
use core::fmt;

use coopnet_core::{Queue, Scheduler};

use super::packetbuf::PacketBuf;
use super::pool::PacketPool;
use super::types::{MacAddr, NetError};

/// A network interface as seen by the stack.
pub trait NetDevice {
    /// Hardware address.
    fn mac(&self) -> MacAddr;

    /// Send one frame carrying `payload` to `dest`.  The payload is already
    /// padded to the Ethernet minimum.
    fn transmit(&self, dest: MacAddr, ethertype: u16, payload: &[u8]) -> Result<(), NetError>;

    /// Start delivering received frames into `rx`.
    fn attach(&self, rx: Rc<RxQueue>);

    fn stats(&self) -> NetDeviceStats;
}

/// Monotonic device counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NetDeviceStats {
    pub rx_packets: u64,
    pub tx_packets: u64,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    /// Frames the device refused to send (not attached, filtered out).
    pub tx_dropped: u64,
    /// Frames discarded on receive (wrong destination, not attached).
    pub rx_dropped: u64,
}

impl NetDeviceStats {
    pub const fn new() -> Self {
        Self {
            rx_packets: 0,
            tx_packets: 0,
            rx_bytes: 0,
            tx_bytes: 0,
            tx_dropped: 0,
            rx_dropped: 0,
        }
    }

    pub(crate) fn count_tx(&mut self, len: usize) {
        self.tx_packets += 1;
        self.tx_bytes += len as u64;
    }

    pub(crate) fn count_rx(&mut self, len: usize) {
        self.rx_packets += 1;
        self.rx_bytes += len as u64;
    }
}

impl fmt::Display for NetDeviceStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "rx: {} pkts/{} bytes, tx: {} pkts/{} bytes, drop: {}/{}",
            self.rx_packets,
            self.rx_bytes,
            self.tx_packets,
            self.tx_bytes,
            self.rx_dropped,
            self.tx_dropped
        )
    }
}

/// One received Ethernet payload.
#[derive(Debug)]
pub struct RxFrame {
    pub src: MacAddr,
    pub ethertype: u16,
    /// The payload; `buf.len()` is the received length including padding.
    pub buf: PacketBuf,
    /// Sent to the broadcast MAC.
    pub broadcast: bool,
    /// Produced by the stack's own 127/8 loopback rather than a device.
    pub looped: bool,
}

/// Frames waiting for the deliver thread.
pub struct RxQueue {
    frames: spin::Mutex<VecDeque<RxFrame>>,
    wait: Queue,
    pool: Rc<PacketPool>,
}

impl RxQueue {
    pub fn new(sched: &Scheduler, pool: Rc<PacketPool>) -> Rc<Self> {
        Rc::new(Self {
            frames: spin::Mutex::new(VecDeque::new()),
            wait: Queue::new(sched),
            pool,
        })
    }

    /// A buffer to copy a received frame into.
    pub fn alloc(&self) -> PacketBuf {
        self.pool.alloc()
    }

    /// Queue a frame and wake the deliver thread.  Never blocks, so devices
    /// may call it from any context.
    pub fn deliver(&self, frame: RxFrame) {
        self.frames.lock().push_back(frame);
        if !self.wait.is_empty() {
            self.wait.unblock();
        }
    }

    /// Frames not yet taken by the deliver thread.
    pub fn pending(&self) -> usize {
        self.frames.lock().len()
    }

    /// Wait for the next frame.
    pub(crate) async fn next(&self) -> RxFrame {
        loop {
            let frame = self.frames.lock().pop_front();
            if let Some(frame) = frame {
                return frame;
            }
            self.wait.block(0).await;
        }
    }
}

impl fmt::Debug for RxQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RxQueue")
            .field("pending", &self.pending())
            .finish()
    }
}
