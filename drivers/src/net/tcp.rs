//! TCP wire format and connection-state vocabulary.
//!
//! Header parsing and construction, the MSS option, wrap-safe sequence
//! comparison, the connection state type and the error type.  The
//! connection engine built on these lives in [`super::tcp_socket`].

use core::fmt;

use bitflags::bitflags;

use super::IP_PAYLOAD_SIZE;

// =============================================================================
// Constants
// =============================================================================

/// Minimum TCP header length (no options).
pub const TCP_HEADER_LEN: usize = 20;

/// Largest segment payload: one IP payload minus a bare TCP header.
pub const TCP_MSS: usize = IP_PAYLOAD_SIZE - TCP_HEADER_LEN;

pub const TCP_OPT_END: u8 = 0;
pub const TCP_OPT_NOP: u8 = 1;
pub const TCP_OPT_MSS: u8 = 2;
pub const TCP_OPT_MSS_LEN: u8 = 4;

bitflags! {
    /// Control bits, the low six bits of header byte 13.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct TcpFlags: u8 {
        const FIN = 0x01;
        const SYN = 0x02;
        const RST = 0x04;
        const PSH = 0x08;
        const ACK = 0x10;
        const URG = 0x20;
    }
}

// =============================================================================
// TCP Header
// =============================================================================

/// Parsed TCP header, fields in host byte order.
#[derive(Clone, Copy, Debug, Default)]
pub struct TcpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq_num: u32,
    pub ack_num: u32,
    /// Data offset in 32-bit words (5–15).
    pub data_offset: u8,
    pub flags: TcpFlags,
    pub window_size: u16,
    pub checksum: u16,
    pub urgent_ptr: u16,
}

impl TcpHeader {
    #[inline]
    pub const fn header_len(&self) -> usize {
        (self.data_offset as usize) * 4
    }

    #[inline]
    pub fn has(&self, flags: TcpFlags) -> bool {
        self.flags.contains(flags)
    }
}

/// Parse a TCP header from the start of a segment.
///
/// Returns `None` if the slice is too short or the data offset is invalid.
pub fn parse_header(data: &[u8]) -> Option<TcpHeader> {
    if data.len() < TCP_HEADER_LEN {
        return None;
    }

    let data_offset = (data[12] >> 4) & 0x0F;
    if data_offset < 5 {
        return None;
    }
    let header_len = (data_offset as usize) * 4;
    if data.len() < header_len {
        return None;
    }

    Some(TcpHeader {
        src_port: u16::from_be_bytes([data[0], data[1]]),
        dst_port: u16::from_be_bytes([data[2], data[3]]),
        seq_num: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
        ack_num: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
        data_offset,
        flags: TcpFlags::from_bits_truncate(data[13]),
        window_size: u16::from_be_bytes([data[14], data[15]]),
        checksum: u16::from_be_bytes([data[16], data[17]]),
        urgent_ptr: u16::from_be_bytes([data[18], data[19]]),
    })
}

/// Find the MSS option in a header's options area.
pub fn parse_mss_option(options: &[u8]) -> Option<u16> {
    let mut i = 0;
    while i < options.len() {
        match options[i] {
            TCP_OPT_END => break,
            TCP_OPT_NOP => {
                i += 1;
            }
            TCP_OPT_MSS => {
                if i + 3 < options.len() && options[i + 1] == TCP_OPT_MSS_LEN {
                    return Some(u16::from_be_bytes([options[i + 2], options[i + 3]]));
                }
                break;
            }
            _ => {
                if i + 1 >= options.len() {
                    break;
                }
                let opt_len = options[i + 1] as usize;
                if opt_len < 2 || i + opt_len > options.len() {
                    break;
                }
                i += opt_len;
            }
        }
    }
    None
}

/// Write `hdr` into the start of `out` with a zero checksum, zeroing any
/// options area the data offset announces.  Returns the header length.
pub fn write_header(hdr: &TcpHeader, out: &mut [u8]) -> Option<usize> {
    let header_len = hdr.header_len();
    if out.len() < header_len || header_len < TCP_HEADER_LEN {
        return None;
    }

    out[0..2].copy_from_slice(&hdr.src_port.to_be_bytes());
    out[2..4].copy_from_slice(&hdr.dst_port.to_be_bytes());
    out[4..8].copy_from_slice(&hdr.seq_num.to_be_bytes());
    out[8..12].copy_from_slice(&hdr.ack_num.to_be_bytes());
    out[12] = (hdr.data_offset << 4) & 0xF0;
    out[13] = hdr.flags.bits() & 0x3F;
    out[14..16].copy_from_slice(&hdr.window_size.to_be_bytes());
    out[16..18].fill(0);
    out[18..20].copy_from_slice(&hdr.urgent_ptr.to_be_bytes());

    if header_len > TCP_HEADER_LEN {
        out[TCP_HEADER_LEN..header_len].fill(0);
    }

    Some(header_len)
}

pub fn build_header(
    src_port: u16,
    dst_port: u16,
    seq_num: u32,
    ack_num: u32,
    flags: TcpFlags,
    window_size: u16,
    data_offset: u8,
) -> TcpHeader {
    TcpHeader {
        src_port,
        dst_port,
        seq_num,
        ack_num,
        data_offset,
        flags,
        window_size,
        checksum: 0,
        urgent_ptr: 0,
    }
}

pub fn write_mss_option(mss: u16, out: &mut [u8]) -> Option<usize> {
    if out.len() < 4 {
        return None;
    }
    out[0] = TCP_OPT_MSS;
    out[1] = TCP_OPT_MSS_LEN;
    out[2..4].copy_from_slice(&mss.to_be_bytes());
    Some(4)
}

// =============================================================================
// Sequence number arithmetic
// =============================================================================

/// Compare sequence numbers modulo 2^32: -1, 0 or 1 as `a` is before,
/// equal to, or after `b`.
#[inline]
pub fn seq_comp(a: u32, b: u32) -> i32 {
    (a.wrapping_sub(b) as i32).signum()
}

#[inline]
pub fn seq_lt(a: u32, b: u32) -> bool {
    seq_comp(a, b) < 0
}

#[inline]
pub fn seq_le(a: u32, b: u32) -> bool {
    seq_comp(a, b) <= 0
}

#[inline]
pub fn seq_gt(a: u32, b: u32) -> bool {
    seq_comp(a, b) > 0
}

#[inline]
pub fn seq_ge(a: u32, b: u32) -> bool {
    seq_comp(a, b) >= 0
}

// =============================================================================
// Connection state
// =============================================================================

/// Where a connection is in its life.  Timestamps are scheduler
/// microseconds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TcpState {
    /// Our SYN is out (or, for a passive open, about to be).
    SynSent,
    SynReceived,
    Established,
    FinWait1,
    FinWait2,
    CloseWait,
    Closing,
    LastAck,
    /// Both FINs exchanged; kept to re-acknowledge a retransmitted FIN.
    TimeWait { since: u64 },
    /// As `TimeWait`, but the client has already closed its handle; the
    /// retransmitter frees the connection once the wait is over.
    TimeWaitClosed { since: u64 },
    /// Not yet opened, fully shut down, or dead.  `failed` is set when the
    /// connection ended by reset, timeout or abort.
    Closed { failed: bool },
}

impl TcpState {
    pub const fn name(self) -> &'static str {
        match self {
            Self::SynSent => "SYN_SENT",
            Self::SynReceived => "SYN_RECEIVED",
            Self::Established => "ESTABLISHED",
            Self::FinWait1 => "FIN_WAIT_1",
            Self::FinWait2 => "FIN_WAIT_2",
            Self::CloseWait => "CLOSE_WAIT",
            Self::Closing => "CLOSING",
            Self::LastAck => "LAST_ACK",
            Self::TimeWait { .. } => "TIME_WAIT",
            Self::TimeWaitClosed { .. } => "TIME_WAIT_CLOSED",
            Self::Closed { .. } => "CLOSED",
        }
    }

    /// States in which the client may still send.
    pub const fn can_send(self) -> bool {
        matches!(self, Self::Established | Self::CloseWait)
    }

    /// States in which arriving data and FINs are processed.
    pub const fn accepts_data(self) -> bool {
        matches!(self, Self::Established | Self::FinWait1 | Self::FinWait2)
    }

    /// States in which the peer has finished sending.
    pub const fn peer_done(self) -> bool {
        matches!(
            self,
            Self::CloseWait
                | Self::Closing
                | Self::LastAck
                | Self::TimeWait { .. }
                | Self::TimeWaitClosed { .. }
                | Self::Closed { .. }
        )
    }

    pub const fn is_closed(self) -> bool {
        matches!(self, Self::Closed { .. })
    }

    pub const fn failed(self) -> bool {
        matches!(self, Self::Closed { failed: true })
    }

    /// Still handshaking.
    pub const fn is_synchronizing(self) -> bool {
        matches!(self, Self::SynSent | Self::SynReceived)
    }
}

impl fmt::Display for TcpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// =============================================================================
// Errors
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TcpError {
    /// Reset by the peer, timed out, or aborted.
    ConnectionDied,
    /// `tcp_connect` or `tcp_accept` gave up waiting.
    TimedOut,
    /// The peer answered our SYN with a reset, or the listener went away.
    Refused,
    /// The local port already has a connection to that peer.
    AddrInUse,
    /// The request makes no sense for this connection or address.
    InvalidState,
}

impl TcpError {
    pub const fn to_code(&self) -> i32 {
        match self {
            Self::ConnectionDied => -1,
            Self::TimedOut => -2,
            Self::Refused => -3,
            Self::AddrInUse => -4,
            Self::InvalidState => -5,
        }
    }
}

impl fmt::Display for TcpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionDied => write!(f, "connection died"),
            Self::TimedOut => write!(f, "timed out"),
            Self::Refused => write!(f, "connection refused"),
            Self::AddrInUse => write!(f, "address in use"),
            Self::InvalidState => write!(f, "invalid state"),
        }
    }
}
