//! DHCP client: address, mask, router and DNS servers at start-up.

use coopnet_lib::{klog_debug, klog_info, klog_warn};

use super::config::MAX_DNS_SERVERS;
use super::netstack::NetStack;
use super::types::{Ipv4Addr, MacAddr};
use super::udp::UdpPortHandler;

pub const UDP_PORT_SERVER: u16 = 67;
pub const UDP_PORT_CLIENT: u16 = 68;

const BOOTREQUEST: u8 = 1;
const BOOTREPLY: u8 = 2;
const HTYPE_ETHERNET: u8 = 1;
const FLAGS_BROADCAST: u16 = 0x8000;
const MAGIC_COOKIE: [u8; 4] = [0x63, 0x82, 0x53, 0x63];

const OPTION_PAD: u8 = 0;
const OPTION_SUBNET_MASK: u8 = 1;
const OPTION_ROUTER: u8 = 3;
const OPTION_DNS: u8 = 6;
const OPTION_REQUESTED_IP: u8 = 50;
const OPTION_MSG_TYPE: u8 = 53;
const OPTION_SERVER_ID: u8 = 54;
const OPTION_PARAM_REQ_LIST: u8 = 55;
const OPTION_END: u8 = 255;

pub const MSG_DISCOVER: u8 = 1;
pub const MSG_OFFER: u8 = 2;
pub const MSG_REQUEST: u8 = 3;
pub const MSG_ACK: u8 = 5;
pub const MSG_NAK: u8 = 6;

/// Fixed BOOTP fields (236 bytes) plus the magic cookie.
pub const BOOTP_HEADER_LEN: usize = 240;
/// Room for the header and the options we send.
const DHCP_MESSAGE_MAX: usize = BOOTP_HEADER_LEN + 32;

const DHCP_TIMEOUT_US: u64 = 5_000_000;
const DHCP_BACKOFF_US: u64 = 1_000_000;

/// Options read from a server message.  Absent options stay unspecified.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DhcpOptions {
    pub message_type: u8,
    pub server_id: Ipv4Addr,
    pub subnet_mask: Ipv4Addr,
    pub router: Ipv4Addr,
    pub dns: [Ipv4Addr; MAX_DNS_SERVERS],
}

/// What the server granted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DhcpLease {
    pub ip: Ipv4Addr,
    pub mask: Ipv4Addr,
    pub router: Ipv4Addr,
    pub dns: [Ipv4Addr; MAX_DNS_SERVERS],
    pub server: Ipv4Addr,
}

/// A server message that passed the BOOTP checks.
#[derive(Clone, Copy, Debug)]
pub struct DhcpReply {
    /// `yiaddr`: the address offered or granted.
    pub your_ip: Ipv4Addr,
    /// `siaddr`: used as server identifier when option 54 is missing.
    pub next_server: Ipv4Addr,
    pub options: DhcpOptions,
}

impl DhcpReply {
    pub fn server(&self) -> Ipv4Addr {
        if self.options.server_id.is_unspecified() {
            self.next_server
        } else {
            self.options.server_id
        }
    }
}

// =============================================================================
// Packet construction
// =============================================================================

/// Write the BOOTP header shared by DISCOVER and REQUEST.  Returns the
/// offset where options begin.
fn write_bootp_header(out: &mut [u8], mac: MacAddr, xid: u32) -> usize {
    out[..BOOTP_HEADER_LEN].fill(0);
    out[0] = BOOTREQUEST;
    out[1] = HTYPE_ETHERNET;
    out[2] = 6;
    out[4..8].copy_from_slice(&xid.to_be_bytes());
    out[10..12].copy_from_slice(&FLAGS_BROADCAST.to_be_bytes());
    out[28..34].copy_from_slice(mac.as_bytes());
    out[236..240].copy_from_slice(&MAGIC_COOKIE);
    BOOTP_HEADER_LEN
}

fn put_option(out: &mut [u8], at: usize, code: u8, data: &[u8]) -> usize {
    out[at] = code;
    out[at + 1] = data.len() as u8;
    out[at + 2..at + 2 + data.len()].copy_from_slice(data);
    at + 2 + data.len()
}

/// Build a DISCOVER into `out` (at least 244 bytes).  Returns its length.
pub fn build_discover(mac: MacAddr, xid: u32, out: &mut [u8]) -> usize {
    let i = write_bootp_header(out, mac, xid);
    let i = put_option(out, i, OPTION_MSG_TYPE, &[MSG_DISCOVER]);
    out[i] = OPTION_END;
    i + 1
}

/// Build a REQUEST for the address in `offer`.  Returns its length.
pub fn build_request(mac: MacAddr, xid: u32, offer: &DhcpReply, out: &mut [u8]) -> usize {
    let i = write_bootp_header(out, mac, xid);
    let i = put_option(out, i, OPTION_REQUESTED_IP, offer.your_ip.as_bytes());
    let i = put_option(out, i, OPTION_MSG_TYPE, &[MSG_REQUEST]);
    let i = put_option(out, i, OPTION_SERVER_ID, offer.server().as_bytes());
    let i = put_option(
        out,
        i,
        OPTION_PARAM_REQ_LIST,
        &[OPTION_SUBNET_MASK, OPTION_ROUTER, OPTION_DNS],
    );
    out[i] = OPTION_END;
    i + 1
}

// =============================================================================
// Parsing
// =============================================================================

/// Walk the options area.  Stops at END or at the first option running
/// past the data; up to four DNS servers are kept.
pub fn read_dhcp_options(options: &[u8]) -> DhcpOptions {
    let mut opts = DhcpOptions::default();
    let mut i = 0usize;
    while i < options.len() {
        let code = options[i];
        if code == OPTION_END {
            return opts;
        }
        if code == OPTION_PAD {
            i += 1;
            continue;
        }
        let Some(&len) = options.get(i + 1) else {
            break;
        };
        let len = len as usize;
        let Some(data) = options.get(i + 2..i + 2 + len) else {
            break;
        };
        match code {
            OPTION_MSG_TYPE if len >= 1 => opts.message_type = data[0],
            OPTION_SERVER_ID if len >= 4 => opts.server_id = Ipv4Addr::from_slice(data),
            OPTION_SUBNET_MASK if len >= 4 => opts.subnet_mask = Ipv4Addr::from_slice(data),
            OPTION_ROUTER if len >= 4 => opts.router = Ipv4Addr::from_slice(data),
            OPTION_DNS => {
                for (slot, addr) in opts.dns.iter_mut().zip(data.chunks_exact(4)) {
                    *slot = Ipv4Addr::from_slice(addr);
                }
            }
            _ => {}
        }
        i += 2 + len;
    }
    klog_debug!("dhcp: options without END");
    opts
}

/// Check a BOOTP reply for transaction `xid` and read its options.
pub fn parse_bootp_reply(payload: &[u8], xid: u32) -> Option<DhcpReply> {
    if payload.len() < BOOTP_HEADER_LEN || payload[0] != BOOTREPLY {
        return None;
    }
    if u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]) != xid {
        return None;
    }
    if payload[236..240] != MAGIC_COOKIE {
        return None;
    }
    Some(DhcpReply {
        your_ip: Ipv4Addr::from_slice(&payload[16..20]),
        next_server: Ipv4Addr::from_slice(&payload[20..24]),
        options: read_dhcp_options(&payload[BOOTP_HEADER_LEN..]),
    })
}

// =============================================================================
// Client
// =============================================================================

impl NetStack {
    /// Obtain a lease and install it as the configuration.  Retries until
    /// a server answers.
    pub async fn dhcp_configure(&self) -> DhcpLease {
        self.udp_register(UDP_PORT_CLIENT, UdpPortHandler::Enqueue);
        let lease = loop {
            if let Some(lease) = self.dhcp_round().await {
                break lease;
            }
            self.scheduler().sleep(DHCP_BACKOFF_US).await;
        };
        self.udp_free_port(UDP_PORT_CLIENT).await;

        let mut cfg = self.config();
        cfg.ip = lease.ip;
        cfg.mask = lease.mask;
        cfg.router = lease.router;
        cfg.dns = lease.dns;
        self.set_config(cfg);
        klog_info!(
            "dhcp: leased {} mask {} router {} from {}",
            lease.ip,
            lease.mask,
            lease.router,
            lease.server
        );
        lease
    }

    /// One DISCOVER/OFFER/REQUEST/ACK exchange.
    async fn dhcp_round(&self) -> Option<DhcpLease> {
        let xid = self.random_u32();
        let mac = self.mac();

        let mut buf = self.pool().alloc();
        let len = build_discover(mac, xid, &mut buf.udp_payload_mut()[..DHCP_MESSAGE_MAX]);
        self.dhcp_send(&mut buf, len).await;
        let Some(offer) = self.dhcp_await(xid, MSG_OFFER).await else {
            klog_warn!("dhcp: no response to discover");
            return None;
        };
        klog_debug!("dhcp: offered {} by {}", offer.your_ip, offer.server());

        let len = build_request(mac, xid, &offer, &mut buf.udp_payload_mut()[..DHCP_MESSAGE_MAX]);
        self.dhcp_send(&mut buf, len).await;
        let Some(ack) = self.dhcp_await(xid, MSG_ACK).await else {
            klog_warn!("dhcp: no response to request");
            return None;
        };
        let opts = ack.options;
        Some(DhcpLease {
            ip: ack.your_ip,
            mask: opts.subnet_mask,
            router: opts.router,
            dns: opts.dns,
            server: ack.server(),
        })
    }

    async fn dhcp_send(&self, buf: &mut super::PacketBuf, len: usize) {
        let sent = self
            .udp_send(buf, Ipv4Addr::BROADCAST, UDP_PORT_SERVER, UDP_PORT_CLIENT, len)
            .await;
        if let Err(e) = sent {
            klog_warn!("dhcp: send failed: {}", e);
        }
    }

    /// Wait up to the receive timeout for a reply of type `expected` to
    /// `xid`.  Replies to other transactions are skipped; a NAK ends the
    /// wait.
    async fn dhcp_await(&self, xid: u32, expected: u8) -> Option<DhcpReply> {
        let deadline = self.now().saturating_add(DHCP_TIMEOUT_US);
        loop {
            let now = self.now();
            if now >= deadline {
                return None;
            }
            let dgram = self.udp_recv(UDP_PORT_CLIENT, deadline - now).await.ok()?;
            let Some(reply) = parse_bootp_reply(dgram.payload(), xid) else {
                continue;
            };
            match reply.options.message_type {
                t if t == expected => return Some(reply),
                MSG_NAK => {
                    klog_warn!("dhcp: NAK from {}", reply.server());
                    return None;
                }
                t => klog_debug!("dhcp: ignoring message type {}", t),
            }
        }
    }
}
