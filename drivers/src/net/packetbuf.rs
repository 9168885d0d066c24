//! Pool-backed packet buffer.
//!
//! A `PacketBuf` holds one IPv4 packet (or ARP message): the link-layer
//! header never lives in the buffer, the device passes it alongside.
//! Protocol layers address their headers at fixed offsets through the
//! accessors below.
//!
//! # Ownership
//!
//! `PacketBuf` is **move-only**.  Dropping it returns its slot to the
//! [`PacketPool`] it came from.  Up-calls receive `&mut PacketBuf`: the
//! buffer is lent for the duration of the call and anything that must
//! outlive it is copied.

use alloc::boxed::Box;
use alloc::rc::Rc;
use core::fmt;

use super::pool::{BUF_SIZE, PacketPool, Slot};
use super::types::Ipv4Addr;
use super::{IPV4_HEADER_LEN, UDP_HEADER_LEN};

pub struct PacketBuf {
    slot: Option<Box<Slot>>,
    len: usize,
    pool: Rc<PacketPool>,
}

impl PacketBuf {
    pub(crate) fn from_slot(slot: Box<Slot>, pool: Rc<PacketPool>) -> Self {
        Self {
            slot: Some(slot),
            len: 0,
            pool,
        }
    }

    /// The whole buffer, regardless of `len`.
    #[inline]
    pub fn bytes(&self) -> &[u8] {
        match &self.slot {
            Some(slot) => &slot.data,
            None => &[],
        }
    }

    #[inline]
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        match &mut self.slot {
            Some(slot) => &mut slot.data,
            None => &mut [],
        }
    }

    /// Bytes of valid data.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn set_len(&mut self, len: usize) {
        self.len = len.min(BUF_SIZE);
    }

    pub const fn capacity(&self) -> usize {
        BUF_SIZE
    }

    /// The valid data, `bytes()[..len()]`.
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.bytes()[..self.len]
    }

    /// Replace the contents with `src` (truncated to the capacity).
    pub fn copy_from(&mut self, src: &[u8]) {
        let n = src.len().min(BUF_SIZE);
        self.bytes_mut()[..n].copy_from_slice(&src[..n]);
        self.len = n;
    }

    /// A fresh buffer from the same pool holding a copy of this one.
    pub fn duplicate(&self) -> PacketBuf {
        let mut copy = self.pool.alloc();
        copy.copy_from(self.data());
        copy
    }

    pub fn pool(&self) -> &Rc<PacketPool> {
        &self.pool
    }

    // =========================================================================
    // IPv4 header access
    // =========================================================================

    /// Start an outgoing IPv4 header: version 4, 20-byte header, protocol
    /// and destination.  Everything else is filled in by `ip_send`.
    pub fn init_ip(&mut self, protocol: u8, dest: Ipv4Addr) {
        let b = self.bytes_mut();
        b[..IPV4_HEADER_LEN].fill(0);
        b[0] = 0x45;
        b[9] = protocol;
        b[16..20].copy_from_slice(dest.as_bytes());
    }

    /// Header length in bytes, from the IHL field (at least 20).
    #[inline]
    pub fn ip_header_len(&self) -> usize {
        (((self.bytes()[0] & 0x0f) as usize) * 4).max(IPV4_HEADER_LEN)
    }

    #[inline]
    pub fn ip_version(&self) -> u8 {
        self.bytes()[0] >> 4
    }

    #[inline]
    pub fn ip_total_len(&self) -> usize {
        u16::from_be_bytes([self.bytes()[2], self.bytes()[3]]) as usize
    }

    /// Fragment offset field (flags masked off).
    #[inline]
    pub fn ip_frag_offset(&self) -> u16 {
        u16::from_be_bytes([self.bytes()[6], self.bytes()[7]]) & 0x1fff
    }

    #[inline]
    pub fn ip_protocol(&self) -> u8 {
        self.bytes()[9]
    }

    #[inline]
    pub fn ip_src(&self) -> Ipv4Addr {
        Ipv4Addr::from_slice(&self.bytes()[12..16])
    }

    #[inline]
    pub fn ip_dst(&self) -> Ipv4Addr {
        Ipv4Addr::from_slice(&self.bytes()[16..20])
    }

    #[inline]
    pub fn set_ip_src(&mut self, addr: Ipv4Addr) {
        self.bytes_mut()[12..16].copy_from_slice(addr.as_bytes());
    }

    #[inline]
    pub fn set_ip_dst(&mut self, addr: Ipv4Addr) {
        self.bytes_mut()[16..20].copy_from_slice(addr.as_bytes());
    }

    /// Length of the IP payload according to the header.
    #[inline]
    pub fn ip_payload_len(&self) -> usize {
        self.ip_total_len()
            .min(BUF_SIZE)
            .saturating_sub(self.ip_header_len())
    }

    /// The IP payload as announced by the total-length field.
    #[inline]
    pub fn ip_payload(&self) -> &[u8] {
        let start = self.ip_header_len();
        let end = (start + self.ip_payload_len()).min(BUF_SIZE);
        &self.bytes()[start..end]
    }

    /// Everything after the IP header, up to the end of the buffer: the
    /// space an outgoing payload is written into.
    #[inline]
    pub fn ip_payload_mut(&mut self) -> &mut [u8] {
        let start = self.ip_header_len();
        &mut self.bytes_mut()[start..]
    }
}

impl PacketBuf {
    /// Where an outgoing transport message goes: straight after a 20-byte
    /// IP header, since we never send options.
    #[inline]
    pub fn tx_payload_mut(&mut self) -> &mut [u8] {
        &mut self.bytes_mut()[IPV4_HEADER_LEN..]
    }

    // =========================================================================
    // UDP access
    // =========================================================================

    /// Source port of a received UDP datagram.
    #[inline]
    pub fn udp_src_port(&self) -> u16 {
        let start = self.ip_header_len();
        u16::from_be_bytes([self.bytes()[start], self.bytes()[start + 1]])
    }

    /// Destination port of a received UDP datagram.
    #[inline]
    pub fn udp_dst_port(&self) -> u16 {
        let start = self.ip_header_len();
        u16::from_be_bytes([self.bytes()[start + 2], self.bytes()[start + 3]])
    }

    /// Payload of a received UDP datagram, as bounded by the IP length.
    #[inline]
    pub fn udp_payload(&self) -> &[u8] {
        self.ip_payload().get(UDP_HEADER_LEN..).unwrap_or(&[])
    }

    /// Where an outgoing datagram's payload goes.
    #[inline]
    pub fn udp_payload_mut(&mut self) -> &mut [u8] {
        &mut self.bytes_mut()[IPV4_HEADER_LEN + UDP_HEADER_LEN..]
    }
}

impl Drop for PacketBuf {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            self.pool.release(slot);
        }
    }
}

impl fmt::Debug for PacketBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PacketBuf {{ len={}, cap={} }}", self.len, BUF_SIZE)
    }
}
