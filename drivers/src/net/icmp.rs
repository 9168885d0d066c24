//! ICMP: echo replies, bounces, and routing of error reports to the
//! transport protocol that caused them.

use alloc::boxed::Box;

use coopnet_core::LocalBoxFuture;
use coopnet_lib::{klog_debug, klog_warn};

use super::netstack::NetStack;
use super::packetbuf::PacketBuf;
use super::types::{Ipv4Addr, NetError};
use super::{
    ICMP_HEADER_LEN, IP_PAYLOAD_SIZE, IPPROTO_ICMP, IPV4_HEADER_LEN, fold_checksum,
    ipv4_header_checksum, ones_complement_sum,
};
use super::ipv4::is_broadcast_for;

pub const ICMP_TYPE_ECHO_REPLY: u8 = 0;
pub const ICMP_TYPE_DEST_UNREACHABLE: u8 = 3;
pub const ICMP_TYPE_SOURCE_QUENCH: u8 = 4;
pub const ICMP_TYPE_ECHO_REQUEST: u8 = 8;
pub const ICMP_TYPE_TIME_EXCEEDED: u8 = 11;
pub const ICMP_TYPE_PARAMETER_PROBLEM: u8 = 12;

pub const ICMP_CODE_PROTOCOL_UNREACHABLE: u8 = 2;
pub const ICMP_CODE_PORT_UNREACHABLE: u8 = 3;

/// Largest ICMP payload (after the 8-byte ICMP header).
pub const ICMP_PAYLOAD_SIZE: usize = IP_PAYLOAD_SIZE - ICMP_HEADER_LEN;

/// Up-call for one ICMP message type.  Gets the whole packet.
pub type IcmpReceiver = for<'a> fn(&'a NetStack, &'a mut PacketBuf) -> LocalBoxFuture<'a, ()>;

pub(crate) struct IcmpLayer {
    receivers: spin::Mutex<[Option<IcmpReceiver>; 256]>,
}

impl IcmpLayer {
    pub(crate) fn new() -> Self {
        let mut receivers: [Option<IcmpReceiver>; 256] = [None; 256];
        receivers[ICMP_TYPE_ECHO_REQUEST as usize] = Some(icmp_echo);
        for problem in [
            ICMP_TYPE_DEST_UNREACHABLE,
            ICMP_TYPE_SOURCE_QUENCH,
            ICMP_TYPE_TIME_EXCEEDED,
            ICMP_TYPE_PARAMETER_PROBLEM,
        ] {
            receivers[problem as usize] = Some(icmp_transport_problem);
        }
        Self {
            receivers: spin::Mutex::new(receivers),
        }
    }
}

/// Checksum over an ICMP message (header and data).  0 when intact.
pub fn icmp_checksum(message: &[u8]) -> u16 {
    fold_checksum(ones_complement_sum(message, 0))
}

/// The IP packet embedded in an ICMP error, with the ICMP packet's own
/// header stripped.
pub fn embedded_packet(buf: &PacketBuf) -> &[u8] {
    let payload = buf.ip_payload();
    payload.get(ICMP_HEADER_LEN..).unwrap_or(&[])
}

fn icmp_echo<'a>(stack: &'a NetStack, buf: &'a mut PacketBuf) -> LocalBoxFuture<'a, ()> {
    Box::pin(async move {
        let len = buf.ip_payload_len();
        let src = buf.ip_src();
        buf.set_ip_dst(src);
        stack.ip_set_source(buf);
        let start = buf.ip_header_len();
        let message = &mut buf.bytes_mut()[start..start + len];
        message[0] = ICMP_TYPE_ECHO_REPLY;
        message[2..4].fill(0);
        let sum = icmp_checksum(message);
        message[2..4].copy_from_slice(&sum.to_be_bytes());
        if let Err(e) = stack.ip_send(buf, len, 0, 0).await {
            klog_debug!("icmp: echo reply to {} failed: {}", src, e);
        }
    })
}

fn icmp_transport_problem<'a>(
    stack: &'a NetStack,
    buf: &'a mut PacketBuf,
) -> LocalBoxFuture<'a, ()> {
    Box::pin(async move {
        let (icmp_type, code) = {
            let payload = buf.ip_payload();
            (payload[0], payload[1])
        };
        let (protocol, original_dest) = {
            let inner = embedded_packet(buf);
            if inner.len() < IPV4_HEADER_LEN || inner[0] >> 4 != 4 {
                return;
            }
            let header_len = ((inner[0] & 0x0f) as usize * 4).max(IPV4_HEADER_LEN);
            if inner.len() < header_len || ipv4_header_checksum(&inner[..header_len]) != 0 {
                klog_debug!("icmp: error report with a damaged inner header");
                return;
            }
            if Ipv4Addr::from_slice(&inner[12..16]) != stack.config().ip || inner[9] == IPPROTO_ICMP {
                return;
            }
            (inner[9], Ipv4Addr::from_slice(&inner[16..20]))
        };
        let unreachable = icmp_type == ICMP_TYPE_DEST_UNREACHABLE
            && (code == ICMP_CODE_PROTOCOL_UNREACHABLE || code == ICMP_CODE_PORT_UNREACHABLE);
        if unreachable || icmp_type == ICMP_TYPE_TIME_EXCEEDED {
            stack.arp_remove(original_dest).await;
        }
        if let Some(receiver) = stack.ip.receiver(protocol) {
            receiver(stack, buf, false).await;
        }
    })
}

/// IP up-call for ICMP.
pub(crate) fn icmp_receive<'a>(
    stack: &'a NetStack,
    buf: &'a mut PacketBuf,
    broadcast: bool,
) -> LocalBoxFuture<'a, ()> {
    Box::pin(async move {
        let payload = buf.ip_payload();
        if payload.len() < ICMP_HEADER_LEN || icmp_checksum(payload) != 0 {
            klog_debug!("icmp: bad checksum from {}", buf.ip_src());
            return;
        }
        if broadcast {
            return;
        }
        let icmp_type = payload[0];
        let receiver = stack.icmp.receivers.lock()[icmp_type as usize];
        match receiver {
            Some(receiver) => receiver(stack, buf).await,
            None => klog_debug!("icmp: unexpected type {} from {}", icmp_type, buf.ip_src()),
        }
    })
}

impl NetStack {
    /// Register the up-call for an ICMP type; `None` ignores that type.
    pub fn icmp_register(&self, icmp_type: u8, receiver: Option<IcmpReceiver>) {
        self.icmp.receivers.lock()[icmp_type as usize] = receiver;
    }

    /// Send an ICMP message to `dest`.  The caller has written the
    /// rest-of-header word and `len` bytes of data into
    /// [`PacketBuf::tx_payload_mut`] after the 8-byte ICMP header; type,
    /// code and checksum are filled in here.
    pub async fn icmp_send(
        &self,
        buf: &mut PacketBuf,
        dest: Ipv4Addr,
        icmp_type: u8,
        code: u8,
        len: usize,
    ) -> Result<(), NetError> {
        let len = len.min(ICMP_PAYLOAD_SIZE);
        buf.init_ip(IPPROTO_ICMP, dest);
        self.ip_set_source(buf);
        let message = &mut buf.ip_payload_mut()[..ICMP_HEADER_LEN + len];
        message[0] = icmp_type;
        message[1] = code;
        message[2..4].fill(0);
        let sum = icmp_checksum(message);
        message[2..4].copy_from_slice(&sum.to_be_bytes());
        self.ip_send(buf, ICMP_HEADER_LEN + len, 0, 0).await
    }

    /// Report a problem with the received packet in `buf` to its sender.
    /// The buffer is overwritten with the report, which quotes the
    /// original IP header and the first 8 payload bytes.  Nothing is sent
    /// about broadcasts, ICMP messages, packets from 0.0.0.0 or non-first
    /// fragments.
    pub async fn icmp_bounce(&self, buf: &mut PacketBuf, broadcast: bool, icmp_type: u8, code: u8) {
        let dest = buf.ip_src();
        if broadcast
            || buf.ip_protocol() == IPPROTO_ICMP
            || dest.is_unspecified()
            || is_broadcast_for(&self.config(), dest)
            || buf.ip_frag_offset() != 0
        {
            return;
        }
        let quoted_len = (buf.ip_header_len() + 8).min(buf.len()).min(ICMP_PAYLOAD_SIZE);
        let mut quoted = [0u8; 68];
        let quoted_len = quoted_len.min(quoted.len());
        quoted[..quoted_len].copy_from_slice(&buf.bytes()[..quoted_len]);

        buf.init_ip(IPPROTO_ICMP, dest);
        let data = buf.ip_payload_mut();
        data[4..ICMP_HEADER_LEN].fill(0);
        data[ICMP_HEADER_LEN..ICMP_HEADER_LEN + quoted_len].copy_from_slice(&quoted[..quoted_len]);
        if let Err(e) = self.icmp_send(buf, dest, icmp_type, code, quoted_len).await {
            klog_warn!("icmp: bounce to {} failed: {}", dest, e);
        }
    }
}
