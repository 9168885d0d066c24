//! ARP: a direct-mapped address cache plus request/reply handling.
//!
//! The cache has [`ARP_CACHE_SIZE`] slots indexed by `addr % ARP_CACHE_SIZE`;
//! a colliding insert simply replaces the previous occupant.  Entries older
//! than the configured lifetime are ignored and re-resolved.  Addresses off
//! our subnet are cached under the router's address, since that is whose MAC
//! frames for them carry.

use alloc::vec;
use alloc::vec::Vec;

use coopnet_core::{Condition, Mutex, Scheduler};
use coopnet_lib::{klog_debug, klog_trace, klog_warn};

use super::config::NetConfig;
use super::netdev::RxFrame;
use super::netstack::NetStack;
use super::types::{EtherType, Ipv4Addr, MacAddr};
use super::{
    ARP_HEADER_LEN, ARP_HLEN_ETHERNET, ARP_HTYPE_ETHERNET, ARP_OPER_REPLY, ARP_OPER_REQUEST,
    ARP_PLEN_IPV4, ARP_PTYPE_IPV4,
};

pub const ARP_CACHE_SIZE: usize = 1023;

#[derive(Clone, Copy, Debug)]
struct ArpEntry {
    addr: Ipv4Addr,
    mac: MacAddr,
    /// Microseconds since start when the entry was learned.
    learned_at: u64,
}

impl ArpEntry {
    const EMPTY: Self = Self {
        addr: Ipv4Addr::UNSPECIFIED,
        mac: MacAddr::ZERO,
        learned_at: 0,
    };
}

pub(crate) struct ArpTable {
    entries: Vec<ArpEntry>,
}

impl ArpTable {
    fn new() -> Self {
        Self {
            entries: vec![ArpEntry::EMPTY; ARP_CACHE_SIZE],
        }
    }

    fn slot(addr: Ipv4Addr) -> usize {
        addr.to_u32() as usize % ARP_CACHE_SIZE
    }

    fn lookup(&self, addr: Ipv4Addr, now: u64, lifetime: u64) -> Option<MacAddr> {
        let entry = &self.entries[Self::slot(addr)];
        if !addr.is_unspecified()
            && entry.addr == addr
            && now.saturating_sub(entry.learned_at) < lifetime
        {
            Some(entry.mac)
        } else {
            None
        }
    }

    fn insert(&mut self, addr: Ipv4Addr, mac: MacAddr, now: u64) {
        self.entries[Self::slot(addr)] = ArpEntry {
            addr,
            mac,
            learned_at: now,
        };
    }

    fn remove(&mut self, addr: Ipv4Addr) {
        let entry = &mut self.entries[Self::slot(addr)];
        if entry.addr == addr {
            *entry = ArpEntry::EMPTY;
        }
    }
}

/// Per-stack ARP state: the cache and the condition resolvers wait on.
pub(crate) struct ArpCache {
    table: Mutex<ArpTable>,
    learned: Condition,
}

impl ArpCache {
    pub(crate) fn new(sched: &Scheduler) -> Self {
        Self {
            table: Mutex::new(sched, ArpTable::new()),
            learned: Condition::new(sched),
        }
    }
}

/// The address whose MAC a frame for `addr` must carry.
fn next_hop(cfg: &NetConfig, addr: Ipv4Addr) -> Ipv4Addr {
    let configured = !cfg.ip.is_unspecified()
        && !cfg.mask.is_unspecified()
        && !cfg.router.is_unspecified();
    if configured && !Ipv4Addr::in_subnet(addr, cfg.ip, cfg.mask) {
        cfg.router
    } else {
        addr
    }
}

/// A parsed ARP message for Ethernet/IPv4.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ArpPacket {
    pub oper: u16,
    pub sender_mac: MacAddr,
    pub sender_ip: Ipv4Addr,
    pub target_mac: MacAddr,
    pub target_ip: Ipv4Addr,
}

impl ArpPacket {
    /// Parse an Ethernet/IPv4 ARP message; anything else is `None`.
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < ARP_HEADER_LEN {
            return None;
        }
        let htype = u16::from_be_bytes([data[0], data[1]]);
        let ptype = u16::from_be_bytes([data[2], data[3]]);
        if htype != ARP_HTYPE_ETHERNET
            || ptype != ARP_PTYPE_IPV4
            || data[4] != ARP_HLEN_ETHERNET
            || data[5] != ARP_PLEN_IPV4
        {
            return None;
        }
        Some(Self {
            oper: u16::from_be_bytes([data[6], data[7]]),
            sender_mac: MacAddr::from_slice(&data[8..14]),
            sender_ip: Ipv4Addr::from_slice(&data[14..18]),
            target_mac: MacAddr::from_slice(&data[18..24]),
            target_ip: Ipv4Addr::from_slice(&data[24..28]),
        })
    }

    /// Write the message into `out`, returning its length.
    pub fn write(&self, out: &mut [u8]) -> usize {
        out[0..2].copy_from_slice(&ARP_HTYPE_ETHERNET.to_be_bytes());
        out[2..4].copy_from_slice(&ARP_PTYPE_IPV4.to_be_bytes());
        out[4] = ARP_HLEN_ETHERNET;
        out[5] = ARP_PLEN_IPV4;
        out[6..8].copy_from_slice(&self.oper.to_be_bytes());
        out[8..14].copy_from_slice(self.sender_mac.as_bytes());
        out[14..18].copy_from_slice(self.sender_ip.as_bytes());
        out[18..24].copy_from_slice(self.target_mac.as_bytes());
        out[24..28].copy_from_slice(self.target_ip.as_bytes());
        ARP_HEADER_LEN
    }
}

impl NetStack {
    fn arp_send(&self, oper: u16, target_mac: MacAddr, target_ip: Ipv4Addr) {
        let packet = ArpPacket {
            oper,
            sender_mac: self.mac(),
            sender_ip: self.config().ip,
            target_mac,
            target_ip,
        };
        let mut buf = self.pool().alloc();
        let len = packet.write(buf.bytes_mut());
        let dest = if oper == ARP_OPER_REQUEST {
            MacAddr::BROADCAST
        } else {
            target_mac
        };
        if let Err(e) = self.enet_send(dest, EtherType::Arp, &mut buf, len) {
            klog_warn!("arp: send to {} failed: {}", target_ip, e);
        }
    }

    /// Resolve `addr` to a MAC address, asking the network if the cache
    /// has nothing fresh.  `None` once every attempt has gone unanswered.
    pub async fn arp_get_mac(&self, addr: Ipv4Addr) -> Option<MacAddr> {
        if addr.is_broadcast() {
            return Some(MacAddr::BROADCAST);
        }
        let cfg = self.config();
        let target = next_hop(&cfg, addr);
        let mut table = self.arp.table.lock().await;
        for _ in 0..cfg.arp.attempts {
            if let Some(mac) = table.lookup(target, self.now(), cfg.arp.lifetime_us) {
                return Some(mac);
            }
            klog_trace!("arp: who-has {}", target);
            self.arp_send(ARP_OPER_REQUEST, MacAddr::BROADCAST, target);
            table = self.arp.learned.timed_wait(table, cfg.arp.wait_us).await.0;
        }
        let found = table.lookup(target, self.now(), cfg.arp.lifetime_us);
        if found.is_none() {
            klog_debug!("arp: no answer for {}", target);
        }
        found
    }

    /// Record a mapping and wake anyone resolving.
    pub async fn arp_insert(&self, addr: Ipv4Addr, mac: MacAddr) {
        if addr.is_unspecified() {
            return;
        }
        let key = next_hop(&self.config(), addr);
        let now = self.now();
        self.arp.table.lock().await.insert(key, mac, now);
        self.arp.learned.broadcast();
    }

    /// Forget the mapping for `addr`, if any.
    pub async fn arp_remove(&self, addr: Ipv4Addr) {
        let key = next_hop(&self.config(), addr);
        self.arp.table.lock().await.remove(key);
    }

    /// Fresh cache entry for `addr`, without asking the network.
    pub async fn arp_lookup(&self, addr: Ipv4Addr) -> Option<MacAddr> {
        let cfg = self.config();
        let key = next_hop(&cfg, addr);
        let now = self.now();
        self.arp.table.lock().await.lookup(key, now, cfg.arp.lifetime_us)
    }

    /// Up-call for a received ARP frame.  Learns the sender whatever the
    /// message and answers requests for our address.
    pub(crate) async fn arp_receive(&self, frame: &RxFrame) {
        let Some(packet) = ArpPacket::parse(frame.buf.data()) else {
            klog_debug!("arp: malformed message from {}", frame.src);
            return;
        };
        self.arp_insert(packet.sender_ip, packet.sender_mac).await;
        let ours = self.config().ip;
        if packet.oper == ARP_OPER_REQUEST && !ours.is_unspecified() && packet.target_ip == ours {
            self.arp_send(ARP_OPER_REPLY, packet.sender_mac, packet.sender_ip);
        }
    }
}
