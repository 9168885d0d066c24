//! Ethernet framing: transmit with minimum-size padding, and dispatch of
//! received frames by EtherType.

use coopnet_lib::{klog_debug, klog_trace};

use super::ENET_MIN_PAYLOAD;
use super::netdev::RxFrame;
use super::netstack::NetStack;
use super::packetbuf::PacketBuf;
use super::types::{EtherType, MacAddr, NetError};

impl NetStack {
    /// Send the first `len` bytes of `buf` to `dest`.  Short payloads are
    /// zero-padded to the 46-byte Ethernet minimum.
    pub fn enet_send(
        &self,
        dest: MacAddr,
        ethertype: EtherType,
        buf: &mut PacketBuf,
        len: usize,
    ) -> Result<(), NetError> {
        let len = len.min(buf.capacity());
        let wire_len = len.max(ENET_MIN_PAYLOAD);
        if wire_len > len {
            buf.bytes_mut()[len..wire_len].fill(0);
        }
        klog_trace!("enet: tx {} bytes of {} to {}", wire_len, ethertype, dest);
        self.device()
            .transmit(dest, ethertype.as_u16(), &buf.bytes()[..wire_len])
    }

    /// Hand one received frame to its protocol.  Runs on the deliver thread.
    pub(crate) async fn enet_dispatch(&self, mut frame: RxFrame) {
        match EtherType::from_u16(frame.ethertype) {
            Some(EtherType::Ipv4) => self.ip_receive(&mut frame).await,
            Some(EtherType::Arp) => self.arp_receive(&frame).await,
            None => klog_debug!(
                "enet: dropping frame with type {:#06x} from {}",
                frame.ethertype,
                frame.src
            ),
        }
    }
}
