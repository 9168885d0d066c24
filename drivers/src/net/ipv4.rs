//! IPv4: header construction on send, validation and protocol dispatch on
//! receive.
//!
//! We never fragment and never send options.  Packets to 127/8 do not
//! touch the device: they are queued straight back onto the stack's own
//! receive queue and marked as looped.

use coopnet_core::LocalBoxFuture;
use coopnet_lib::{klog_debug, klog_trace};

use super::config::NetConfig;
use super::icmp::{ICMP_CODE_PROTOCOL_UNREACHABLE, ICMP_TYPE_DEST_UNREACHABLE};
use super::netdev::RxFrame;
use super::netstack::NetStack;
use super::packetbuf::PacketBuf;
use super::types::{EtherType, IpProtocol, Ipv4Addr, MacAddr, NetError};
use super::{ENET_PAYLOAD_SIZE, IP_DEFAULT_TTL, IPV4_HEADER_LEN, ipv4_header_checksum, payload_checksum};

/// Up-call for one IP protocol.  Receives the whole packet and whether it
/// was sent to a broadcast or multicast address.  ICMP errors about a
/// packet of this protocol are delivered the same way, with the ICMP
/// packet in the buffer.
pub type IpReceiver = for<'a> fn(&'a NetStack, &'a mut PacketBuf, bool) -> LocalBoxFuture<'a, ()>;

pub(crate) struct IpLayer {
    receivers: spin::Mutex<[Option<IpReceiver>; 256]>,
}

impl IpLayer {
    pub(crate) fn new() -> Self {
        Self {
            receivers: spin::Mutex::new([None; 256]),
        }
    }

    pub(crate) fn receiver(&self, protocol: u8) -> Option<IpReceiver> {
        self.receivers.lock()[protocol as usize]
    }
}

/// All-ones host part on our subnet.
fn is_subnet_broadcast(cfg: &NetConfig, addr: Ipv4Addr) -> bool {
    if cfg.ip.is_unspecified() || cfg.mask.is_unspecified() || cfg.mask.is_broadcast() {
        return false;
    }
    let host = !cfg.mask.to_u32();
    addr.to_u32() & host == host
}

/// Limited, subnet-directed, or multicast destination.
pub fn is_broadcast_for(cfg: &NetConfig, addr: Ipv4Addr) -> bool {
    addr.is_broadcast() || addr.is_multicast() || is_subnet_broadcast(cfg, addr)
}

/// Transport checksum of the `len`-byte IP payload of `buf`, pseudo-header
/// included, using the addresses and protocol already in its header.
pub fn ip_payload_checksum(buf: &PacketBuf, len: usize) -> u16 {
    let start = buf.ip_header_len();
    let end = (start + len).min(buf.capacity());
    payload_checksum(buf.ip_src(), buf.ip_dst(), buf.ip_protocol(), &buf.bytes()[start..end])
}

impl NetStack {
    /// Register the up-call for `protocol`; `None` restores the default,
    /// which answers with ICMP protocol-unreachable.
    pub fn ip_register(&self, protocol: u8, receiver: Option<IpReceiver>) {
        self.ip.receivers.lock()[protocol as usize] = receiver;
    }

    /// Fill in the source address appropriate for the destination already
    /// in `buf`.
    pub fn ip_set_source(&self, buf: &mut PacketBuf) {
        let src = if buf.ip_dst().is_loopback() {
            Ipv4Addr::LOCALHOST
        } else {
            self.config().ip
        };
        buf.set_ip_src(src);
    }

    /// Complete the IP header of `buf` and send it.  Protocol, version and
    /// header length, source and destination are set by the caller; `len`
    /// is the payload length.  `ttl` 0 means the default of 64.
    pub async fn ip_send(
        &self,
        buf: &mut PacketBuf,
        len: usize,
        ttl: u8,
        tos: u8,
    ) -> Result<(), NetError> {
        let header_len = buf.ip_header_len();
        let total = header_len + len;
        if total > ENET_PAYLOAD_SIZE {
            return Err(NetError::MessageTooLong);
        }
        let id = self.random_u16();
        {
            let b = buf.bytes_mut();
            b[1] = tos;
            b[2..4].copy_from_slice(&(total as u16).to_be_bytes());
            b[4..6].copy_from_slice(&id.to_be_bytes());
            b[6..8].fill(0);
            b[8] = if ttl == 0 { IP_DEFAULT_TTL } else { ttl };
            b[10..12].fill(0);
            let sum = ipv4_header_checksum(&b[..header_len]);
            b[10..12].copy_from_slice(&sum.to_be_bytes());
        }
        buf.set_len(total);

        let dest = buf.ip_dst();
        if dest.is_loopback() {
            let copy = buf.duplicate();
            self.rx_queue().deliver(RxFrame {
                src: self.mac(),
                ethertype: EtherType::Ipv4.as_u16(),
                buf: copy,
                broadcast: false,
                looped: true,
            });
            return Ok(());
        }
        let mac = if is_broadcast_for(&self.config(), dest) {
            MacAddr::BROADCAST
        } else {
            match self.arp_get_mac(dest).await {
                Some(mac) => mac,
                None => {
                    klog_debug!("ip: no MAC address for {}", dest);
                    return Err(NetError::HostUnreachable);
                }
            }
        };
        self.enet_send(mac, EtherType::Ipv4, buf, total)
    }

    /// Up-call from the Ethernet layer for an IPv4 frame.
    pub(crate) async fn ip_receive(&self, frame: &mut RxFrame) {
        let buf = &mut frame.buf;
        let header_len = buf.ip_header_len();
        if buf.len() < IPV4_HEADER_LEN
            || buf.ip_version() != 4
            || header_len > buf.len()
            || ipv4_header_checksum(&buf.bytes()[..header_len]) != 0
        {
            klog_debug!("ip: invalid header ({} bytes from {})", buf.len(), frame.src);
            return;
        }
        let total = buf.ip_total_len();
        if total < header_len || total > buf.len() {
            klog_debug!("ip: bad total length {} in {}-byte frame", total, buf.len());
            return;
        }
        // Drop any Ethernet padding.
        buf.set_len(total);

        let cfg = self.config();
        let src = buf.ip_src();
        let dest = buf.ip_dst();
        let broadcast = frame.broadcast || is_broadcast_for(&cfg, dest);
        let local = frame.looped && dest.is_loopback();
        if !cfg.ip.is_unspecified() && dest != cfg.ip && !broadcast && !local {
            klog_debug!("ip: non-local destination {}", dest);
            return;
        }
        if src.is_broadcast()
            || src.is_multicast()
            || is_subnet_broadcast(&cfg, src)
            || (src.is_loopback() && !frame.looped)
        {
            klog_debug!("ip: illegal source {}", src);
            return;
        }
        if !frame.looped {
            self.arp_insert(src, frame.src).await;
        }

        let protocol = buf.ip_protocol();
        klog_trace!("ip: {} bytes proto {} from {}", total, protocol, src);
        match self.ip.receiver(protocol) {
            Some(receiver) => receiver(self, buf, broadcast).await,
            None => self.ip_discard(buf, broadcast).await,
        }
    }

    async fn ip_discard(&self, buf: &mut PacketBuf, broadcast: bool) {
        let protocol = buf.ip_protocol();
        match IpProtocol::from_u8(protocol) {
            Some(known) => klog_debug!("ip: no receiver for {}", known),
            None => klog_debug!("ip: unexpected protocol {}", protocol),
        }
        self.icmp_bounce(
            buf,
            broadcast,
            ICMP_TYPE_DEST_UNREACHABLE,
            ICMP_CODE_PROTOCOL_UNREACHABLE,
        )
        .await;
    }
}
