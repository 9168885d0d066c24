//! Software devices: a loopback interface and a point-to-point link.
//!
//! [`LoopbackDev`] reflects every transmitted frame straight back into its
//! own receive queue, so a single stack can talk to itself through ARP and
//! IP exactly as it would over a wire.
//!
//! [`Link`] is a virtual cable with two ends, each a [`NetDevice`] for its
//! own stack.  A frame filter sees every frame in flight and may pass it,
//! drop it, or hold it back until [`Link::release_held`] delivers it, which
//! is how loss and reordering are injected.

use alloc::boxed::Box;
use alloc::rc::Rc;
use alloc::vec::Vec;

use super::netdev::{NetDevice, NetDeviceStats, RxFrame, RxQueue};
use super::types::{MacAddr, NetError};
use super::{ETH_HEADER_LEN, IPPROTO_TCP};
use super::tcp::{TcpHeader, parse_header};

fn reflect(rx: &RxQueue, src: MacAddr, dest: MacAddr, ethertype: u16, payload: &[u8]) {
    let mut buf = rx.alloc();
    buf.copy_from(payload);
    rx.deliver(RxFrame {
        src,
        ethertype,
        buf,
        broadcast: dest.is_broadcast(),
        looped: false,
    });
}

// =============================================================================
// Loopback
// =============================================================================

struct LoopbackInner {
    rx: Option<Rc<RxQueue>>,
    stats: NetDeviceStats,
}

pub struct LoopbackDev {
    mac: MacAddr,
    inner: spin::Mutex<LoopbackInner>,
}

impl LoopbackDev {
    pub fn new(mac: MacAddr) -> Self {
        Self {
            mac,
            inner: spin::Mutex::new(LoopbackInner {
                rx: None,
                stats: NetDeviceStats::new(),
            }),
        }
    }
}

impl NetDevice for LoopbackDev {
    fn mac(&self) -> MacAddr {
        self.mac
    }

    fn transmit(&self, dest: MacAddr, ethertype: u16, payload: &[u8]) -> Result<(), NetError> {
        let rx = {
            let mut inner = self.inner.lock();
            if inner.rx.is_none() {
                inner.stats.tx_dropped += 1;
                return Err(NetError::LinkDown);
            }
            inner.stats.count_tx(payload.len());
            inner.stats.count_rx(payload.len());
            inner.rx.clone()
        };
        if let Some(rx) = rx {
            reflect(&rx, self.mac, dest, ethertype, payload);
        }
        Ok(())
    }

    fn attach(&self, rx: Rc<RxQueue>) {
        self.inner.lock().rx = Some(rx);
    }

    fn stats(&self) -> NetDeviceStats {
        self.inner.lock().stats
    }
}

// =============================================================================
// Link
// =============================================================================

/// What the link filter decides for one frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkVerdict {
    Pass,
    Drop,
    /// Keep the frame until [`Link::release_held`].
    Hold,
}

/// A frame in flight on a [`Link`].
#[derive(Clone, Debug)]
pub struct LinkFrame {
    /// Index of the sending end: 0 or 1.
    pub from: usize,
    pub dest: MacAddr,
    pub ethertype: u16,
    pub payload: Vec<u8>,
}

impl LinkFrame {
    /// The TCP header and payload, if this frame carries a TCP segment.
    pub fn tcp_segment(&self) -> Option<(TcpHeader, &[u8])> {
        let ip = &self.payload;
        if ip.len() < 20 || ip[0] >> 4 != 4 || ip[9] != IPPROTO_TCP {
            return None;
        }
        let ihl = ((ip[0] & 0x0f) as usize) * 4;
        let total = (u16::from_be_bytes([ip[2], ip[3]]) as usize).min(ip.len());
        let segment = ip.get(ihl..total)?;
        let header = parse_header(segment)?;
        Some((header, &segment[header.header_len()..]))
    }

    /// Size on the wire, link header included.
    pub fn wire_len(&self) -> usize {
        ETH_HEADER_LEN + self.payload.len()
    }
}

pub type LinkFilter = Box<dyn FnMut(&LinkFrame) -> LinkVerdict>;

struct LinkPort {
    mac: MacAddr,
    rx: Option<Rc<RxQueue>>,
    stats: NetDeviceStats,
}

struct LinkShared {
    ports: [LinkPort; 2],
    filter: Option<LinkFilter>,
    held: Vec<LinkFrame>,
    frames: u64,
}

impl LinkShared {
    /// Account for a frame arriving at the far end and return where it goes.
    fn route(&mut self, frame: &LinkFrame) -> Option<(Rc<RxQueue>, MacAddr)> {
        let src = self.ports[frame.from].mac;
        let port = &mut self.ports[1 - frame.from];
        if !frame.dest.is_broadcast() && frame.dest != port.mac {
            port.stats.rx_dropped += 1;
            return None;
        }
        match &port.rx {
            Some(rx) => {
                port.stats.count_rx(frame.payload.len());
                Some((rx.clone(), src))
            }
            None => {
                port.stats.rx_dropped += 1;
                None
            }
        }
    }
}

/// Control handle of a virtual cable.
#[derive(Clone)]
pub struct Link {
    shared: Rc<spin::Mutex<LinkShared>>,
}

/// One end of a [`Link`], handed to a stack as its device.
pub struct LinkEnd {
    shared: Rc<spin::Mutex<LinkShared>>,
    side: usize,
}

impl Link {
    pub fn new(mac_a: MacAddr, mac_b: MacAddr) -> (Link, LinkEnd, LinkEnd) {
        let port = |mac| LinkPort {
            mac,
            rx: None,
            stats: NetDeviceStats::new(),
        };
        let shared = Rc::new(spin::Mutex::new(LinkShared {
            ports: [port(mac_a), port(mac_b)],
            filter: None,
            held: Vec::new(),
            frames: 0,
        }));
        (
            Link {
                shared: shared.clone(),
            },
            LinkEnd {
                shared: shared.clone(),
                side: 0,
            },
            LinkEnd { shared, side: 1 },
        )
    }

    /// Install a filter consulted for every frame from now on.
    pub fn set_filter<F>(&self, filter: F)
    where
        F: FnMut(&LinkFrame) -> LinkVerdict + 'static,
    {
        self.shared.lock().filter = Some(Box::new(filter));
    }

    pub fn clear_filter(&self) {
        let old = self.shared.lock().filter.take();
        drop(old);
    }

    /// Frames currently held back by the filter.
    pub fn held(&self) -> usize {
        self.shared.lock().held.len()
    }

    /// Deliver held frames in the given order (indices into the held list,
    /// oldest first).  Frames not named are discarded.
    pub fn release_held(&self, order: &[usize]) {
        let mut deliveries = Vec::new();
        {
            let mut shared = self.shared.lock();
            let held = core::mem::take(&mut shared.held);
            for &i in order {
                if let Some(frame) = held.get(i) {
                    if let Some((rx, src)) = shared.route(frame) {
                        deliveries.push((rx, src, frame.clone()));
                    }
                }
            }
        }
        for (rx, src, frame) in deliveries {
            reflect(&rx, src, frame.dest, frame.ethertype, &frame.payload);
        }
    }

    /// Frames offered to the link so far, whatever the filter decided.
    pub fn frames(&self) -> u64 {
        self.shared.lock().frames
    }
}

impl NetDevice for LinkEnd {
    fn mac(&self) -> MacAddr {
        self.shared.lock().ports[self.side].mac
    }

    fn transmit(&self, dest: MacAddr, ethertype: u16, payload: &[u8]) -> Result<(), NetError> {
        let frame = LinkFrame {
            from: self.side,
            dest,
            ethertype,
            payload: payload.to_vec(),
        };
        let delivery = {
            let mut shared = self.shared.lock();
            shared.frames += 1;
            shared.ports[self.side].stats.count_tx(payload.len());
            let verdict = match shared.filter.as_mut() {
                Some(filter) => filter(&frame),
                None => LinkVerdict::Pass,
            };
            match verdict {
                LinkVerdict::Pass => shared.route(&frame),
                LinkVerdict::Drop => None,
                LinkVerdict::Hold => {
                    shared.held.push(frame.clone());
                    None
                }
            }
        };
        if let Some((rx, src)) = delivery {
            reflect(&rx, src, dest, ethertype, payload);
        }
        Ok(())
    }

    fn attach(&self, rx: Rc<RxQueue>) {
        self.shared.lock().ports[self.side].rx = Some(rx);
    }

    fn stats(&self) -> NetDeviceStats {
        self.shared.lock().ports[self.side].stats
    }
}
