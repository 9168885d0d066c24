//! DNS client: A-record lookups over UDP.
//!
//! Queries go to the configured servers in turn, assuming they recurse.
//! Dotted-decimal literals are answered without a query.

use core::fmt;

use coopnet_lib::klog_debug;

use super::netstack::NetStack;
use super::types::Ipv4Addr;
use super::udp::{UDP_PAYLOAD_SIZE, UdpPortHandler};

// =============================================================================
// Constants
// =============================================================================

/// Standard DNS UDP port.
pub const DNS_PORT: u16 = 53;
/// DNS header length.
const DNS_HEADER_LEN: usize = 12;
/// Maximum label length (RFC 1035).
const DNS_LABEL_MAX: usize = 63;
/// Labels skipped in one name before it is deemed malformed.
const MAX_LABELS: usize = 128;
/// Queries sent before giving up, rotating across the servers.
const DNS_MAX_TRIES: usize = 8;
/// Wait for each response, in microseconds.
const DNS_TIMEOUT_US: u64 = 3_000_000;

const DNS_TYPE_A: u16 = 1;
const DNS_CLASS_IN: u16 = 1;

/// Flags word of a standard query with recursion desired.
const DNS_FLAGS_QUERY_RD: u16 = 0x0100;
const DNS_FLAG_RESPONSE: u16 = 0x8000;

const RCODE_FORMAT_ERROR: u8 = 1;
const RCODE_SERVER_FAILURE: u8 = 2;
const RCODE_NAME_ERROR: u8 = 3;
const RCODE_NOT_IMPLEMENTED: u8 = 4;
const RCODE_REFUSED: u8 = 5;

// =============================================================================
// Types
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DnsError {
    /// The name does not fit a query.
    NameTooLong,
    /// No DNS server is configured.
    NoServer,
    /// No usable response after every attempt.
    Timeout,
    /// The server could not parse our query.
    MalformedQuery,
    /// The name does not exist.
    NameNotFound,
    ServerRefused,
    /// The name exists but has no IPv4 address.
    NameHasNoAddress,
    MalformedResponse,
}

impl DnsError {
    pub const fn to_code(&self) -> i32 {
        match self {
            Self::NameTooLong => -1,
            Self::NoServer => -2,
            Self::Timeout => -3,
            Self::MalformedQuery => -4,
            Self::NameNotFound => -5,
            Self::ServerRefused => -6,
            Self::NameHasNoAddress => -7,
            Self::MalformedResponse => -8,
        }
    }
}

impl fmt::Display for DnsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NameTooLong => write!(f, "name too long"),
            Self::NoServer => write!(f, "no DNS server"),
            Self::Timeout => write!(f, "DNS timed out"),
            Self::MalformedQuery => write!(f, "server rejected query"),
            Self::NameNotFound => write!(f, "name not found"),
            Self::ServerRefused => write!(f, "server refused"),
            Self::NameHasNoAddress => write!(f, "name has no address"),
            Self::MalformedResponse => write!(f, "malformed response"),
        }
    }
}

/// Parsed DNS header (12 bytes).
#[derive(Clone, Copy, Debug, Default)]
pub struct DnsHeader {
    pub id: u16,
    pub flags: u16,
    pub qdcount: u16,
    pub ancount: u16,
    pub nscount: u16,
    pub arcount: u16,
}

impl DnsHeader {
    /// QR bit: set on responses.
    pub fn is_response(&self) -> bool {
        (self.flags & DNS_FLAG_RESPONSE) != 0
    }

    /// RCODE (low 4 bits of flags).
    pub fn rcode(&self) -> u8 {
        (self.flags & 0x000F) as u8
    }

    fn to_bytes(self, buf: &mut [u8]) {
        buf[0..2].copy_from_slice(&self.id.to_be_bytes());
        buf[2..4].copy_from_slice(&self.flags.to_be_bytes());
        buf[4..6].copy_from_slice(&self.qdcount.to_be_bytes());
        buf[6..8].copy_from_slice(&self.ancount.to_be_bytes());
        buf[8..10].copy_from_slice(&self.nscount.to_be_bytes());
        buf[10..12].copy_from_slice(&self.arcount.to_be_bytes());
    }

    fn from_bytes(buf: &[u8]) -> Option<Self> {
        if buf.len() < DNS_HEADER_LEN {
            return None;
        }
        Some(DnsHeader {
            id: u16::from_be_bytes([buf[0], buf[1]]),
            flags: u16::from_be_bytes([buf[2], buf[3]]),
            qdcount: u16::from_be_bytes([buf[4], buf[5]]),
            ancount: u16::from_be_bytes([buf[6], buf[7]]),
            nscount: u16::from_be_bytes([buf[8], buf[9]]),
            arcount: u16::from_be_bytes([buf[10], buf[11]]),
        })
    }
}

// =============================================================================
// Query construction
// =============================================================================

/// Encode a hostname as length-prefixed labels ending in the root label.
///
/// `"example.com"` → `[7, e,x,a,m,p,l,e, 3, c,o,m, 0]`
///
/// Returns the number of bytes written, or `None` if a label is empty or
/// too long, or `buf` is too small.
pub fn dns_encode_name(hostname: &[u8], buf: &mut [u8]) -> Option<usize> {
    let hostname = hostname.strip_suffix(b".").unwrap_or(hostname);
    let mut out_pos = 0usize;
    if !hostname.is_empty() {
        for label in hostname.split(|&b| b == b'.') {
            if label.is_empty() || label.len() > DNS_LABEL_MAX {
                return None;
            }
            // Length byte, label, and at least the trailing zero.
            if out_pos + 1 + label.len() >= buf.len() {
                return None;
            }
            buf[out_pos] = label.len() as u8;
            out_pos += 1;
            buf[out_pos..out_pos + label.len()].copy_from_slice(label);
            out_pos += label.len();
        }
    }
    *buf.get_mut(out_pos)? = 0;
    Some(out_pos + 1)
}

/// Build an A/IN query for `hostname`.  Returns the message length.
pub fn dns_build_query(id: u16, hostname: &[u8], buf: &mut [u8]) -> Option<usize> {
    if buf.len() < DNS_HEADER_LEN + 5 {
        return None;
    }
    DnsHeader {
        id,
        flags: DNS_FLAGS_QUERY_RD,
        qdcount: 1,
        ..DnsHeader::default()
    }
    .to_bytes(&mut buf[..DNS_HEADER_LEN]);

    let name_len = dns_encode_name(hostname, &mut buf[DNS_HEADER_LEN..])?;
    let q = DNS_HEADER_LEN + name_len;
    let tail = buf.get_mut(q..q + 4)?;
    tail[0..2].copy_from_slice(&DNS_TYPE_A.to_be_bytes());
    tail[2..4].copy_from_slice(&DNS_CLASS_IN.to_be_bytes());
    Some(q + 4)
}

// =============================================================================
// Response parsing
// =============================================================================

/// Offset just past the name at `pos`.  A compression pointer ends the
/// name, so it is never followed.
fn skip_dns_name(packet: &[u8], mut pos: usize) -> Option<usize> {
    for _ in 0..MAX_LABELS {
        let b = *packet.get(pos)?;
        if b == 0 {
            return Some(pos + 1);
        }
        if (b & 0xC0) == 0xC0 {
            packet.get(pos + 1)?;
            return Some(pos + 2);
        }
        if (b & 0xC0) != 0 {
            return None;
        }
        pos += 1 + b as usize;
    }
    None
}

/// Interpret a datagram received in answer to query `expected_id`.
///
/// `None` means it is not a usable answer (wrong id, not a response, or a
/// server failure worth retrying elsewhere).  Otherwise the first A record
/// of class IN, or the error the server reported.
pub fn dns_parse_response(packet: &[u8], expected_id: u16) -> Option<Result<Ipv4Addr, DnsError>> {
    let header = DnsHeader::from_bytes(packet)?;
    if header.id != expected_id || !header.is_response() {
        return None;
    }
    match header.rcode() {
        RCODE_SERVER_FAILURE | RCODE_NOT_IMPLEMENTED => return None,
        rcode if rcode > RCODE_REFUSED => return None,
        RCODE_FORMAT_ERROR => return Some(Err(DnsError::MalformedQuery)),
        RCODE_NAME_ERROR => return Some(Err(DnsError::NameNotFound)),
        RCODE_REFUSED => return Some(Err(DnsError::ServerRefused)),
        _ => {}
    }
    if header.ancount == 0 {
        return Some(Err(DnsError::NameHasNoAddress));
    }
    Some(first_address(packet, &header))
}

fn first_address(packet: &[u8], header: &DnsHeader) -> Result<Ipv4Addr, DnsError> {
    let mut pos = DNS_HEADER_LEN;
    for _ in 0..header.qdcount {
        pos = skip_dns_name(packet, pos).ok_or(DnsError::MalformedResponse)? + 4;
    }
    for _ in 0..header.ancount {
        pos = skip_dns_name(packet, pos).ok_or(DnsError::MalformedResponse)?;
        let rr = packet
            .get(pos..pos + 10)
            .ok_or(DnsError::MalformedResponse)?;
        let rr_type = u16::from_be_bytes([rr[0], rr[1]]);
        let rr_class = u16::from_be_bytes([rr[2], rr[3]]);
        let rdlength = u16::from_be_bytes([rr[8], rr[9]]) as usize;
        pos += 10;
        let rdata = packet
            .get(pos..pos + rdlength)
            .ok_or(DnsError::MalformedResponse)?;
        if rr_type == DNS_TYPE_A && rr_class == DNS_CLASS_IN && rdlength == 4 {
            return Ok(Ipv4Addr::from_slice(rdata));
        }
        pos += rdlength;
    }
    Err(DnsError::NameHasNoAddress)
}

// =============================================================================
// Resolver
// =============================================================================

impl NetStack {
    /// Resolve `name` to an IPv4 address.
    pub async fn dns_lookup(&self, name: &str) -> Result<Ipv4Addr, DnsError> {
        if let Some(addr) = Ipv4Addr::parse(name) {
            return Ok(addr);
        }

        let mut buf = self.pool().alloc();
        let id = self.random_u16();
        let len = {
            let payload = buf.udp_payload_mut();
            let room = payload.len().min(UDP_PAYLOAD_SIZE);
            dns_build_query(id, name.as_bytes(), &mut payload[..room])
                .ok_or(DnsError::NameTooLong)?
        };

        let port = self.udp_alloc_port(UdpPortHandler::Enqueue);
        let result = self.dns_exchange(&mut buf, len, id, port).await;
        self.udp_free_port(port).await;
        match result {
            Ok(addr) => klog_debug!("dns: {} is {}", name, addr),
            Err(e) => klog_debug!("dns: lookup of {} failed: {}", name, e),
        }
        result
    }

    async fn dns_exchange(
        &self,
        buf: &mut super::PacketBuf,
        len: usize,
        id: u16,
        port: u16,
    ) -> Result<Ipv4Addr, DnsError> {
        let mut next_server = 0;
        for attempt in 0..DNS_MAX_TRIES {
            let servers = self.config().dns;
            if next_server >= servers.len() || servers[next_server].is_unspecified() {
                next_server = 0;
            }
            let server = servers[next_server];
            if server.is_unspecified() {
                return Err(DnsError::NoServer);
            }
            next_server += 1;

            if let Err(e) = self.udp_send(buf, server, DNS_PORT, port, len).await {
                klog_debug!("dns: send to {} failed: {} (attempt {})", server, e, attempt);
                continue;
            }
            match self.udp_recv(port, DNS_TIMEOUT_US).await {
                Ok(dgram) => {
                    if let Some(result) = dns_parse_response(dgram.payload(), id) {
                        return result;
                    }
                    klog_debug!("dns: unusable reply from {} (attempt {})", dgram.src(), attempt);
                }
                Err(e) => klog_debug!("dns: {} from {} (attempt {})", e, server, attempt),
            }
        }
        Err(DnsError::Timeout)
    }
}
