//! The network stack: Ethernet, ARP, IPv4, ICMP, UDP, TCP, DNS, DHCP and
//! TFTP over a single interface, driven by cooperative threads.
//!
//! Every layer is a set of methods on [`NetStack`](netstack::NetStack).
//! Received frames are delivered by one thread per stack; each layer's
//! receive handler runs on it as an up-call and copies or queues what it
//! needs before returning.

pub mod arp;
pub mod config;
pub mod dhcp;
pub mod dns;
pub mod ethernet;
pub mod icmp;
pub mod ipv4;
pub mod loopback;
pub mod netdev;
pub mod netstack;
pub mod packetbuf;
pub mod pool;
pub mod tcp;
pub mod tcp_socket;
pub mod tftp;
pub mod types;
pub mod udp;

pub use config::{ArpTuning, NetConfig, TcpTuning};
pub use netstack::NetStack;
pub use packetbuf::PacketBuf;
pub use pool::PacketPool;
pub use types::{Ipv4Addr, MacAddr, NetError, SockAddr};

// =============================================================================
// Ethernet
// =============================================================================

pub const ETH_HEADER_LEN: usize = 14;
/// Largest payload of one Ethernet frame.
pub const ENET_PAYLOAD_SIZE: usize = 1500;
/// Payloads are padded to this size (a 60-byte frame without CRC).
pub const ENET_MIN_PAYLOAD: usize = 46;

// =============================================================================
// ARP (Ethernet + IPv4 only)
// =============================================================================

pub const ARP_HTYPE_ETHERNET: u16 = 1;
pub const ARP_PTYPE_IPV4: u16 = 0x0800;
pub const ARP_HLEN_ETHERNET: u8 = 6;
pub const ARP_PLEN_IPV4: u8 = 4;
pub const ARP_OPER_REQUEST: u16 = 1;
pub const ARP_OPER_REPLY: u16 = 2;
pub const ARP_HEADER_LEN: usize = 28;

// =============================================================================
// IPv4
// =============================================================================

/// Header length we send with (no options).
pub const IPV4_HEADER_LEN: usize = 20;
/// Largest IP payload that fits one frame.
pub const IP_PAYLOAD_SIZE: usize = ENET_PAYLOAD_SIZE - IPV4_HEADER_LEN;
pub const IP_DEFAULT_TTL: u8 = 64;
pub const IPPROTO_ICMP: u8 = 1;
pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;

pub const UDP_HEADER_LEN: usize = 8;
pub const ICMP_HEADER_LEN: usize = 8;

// =============================================================================
// Checksums
// =============================================================================

/// One's-complement sum of `data` as big-endian 16-bit words, added to
/// `initial`.  A trailing odd byte is padded with zero.
pub fn ones_complement_sum(data: &[u8], initial: u32) -> u32 {
    let mut sum = initial;
    let mut words = data.chunks_exact(2);
    for word in &mut words {
        sum = sum.wrapping_add(u16::from_be_bytes([word[0], word[1]]) as u32);
    }
    if let [last] = words.remainder() {
        sum = sum.wrapping_add((*last as u32) << 8);
    }
    sum
}

/// Fold a 32-bit accumulator into the inverted 16-bit checksum.
pub fn fold_checksum(mut sum: u32) -> u16 {
    while (sum >> 16) != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// Checksum of an IPv4 header.  Over a header with a valid checksum field
/// the result is 0.
pub fn ipv4_header_checksum(header: &[u8]) -> u16 {
    fold_checksum(ones_complement_sum(header, 0))
}

/// Sum of the IPv4 pseudo-header used by TCP and UDP.
pub fn pseudo_header_sum(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, len: usize) -> u32 {
    let mut sum = ones_complement_sum(src.as_bytes(), 0);
    sum = ones_complement_sum(dst.as_bytes(), sum);
    sum.wrapping_add(protocol as u32).wrapping_add(len as u32)
}

/// Checksum of a transport segment plus its pseudo-header.  Computed over a
/// segment whose checksum field is zero it yields the value to store; over
/// a received segment it yields 0 when the segment is intact.
pub fn payload_checksum(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, segment: &[u8]) -> u16 {
    fold_checksum(ones_complement_sum(
        segment,
        pseudo_header_sum(src, dst, protocol, segment.len()),
    ))
}
