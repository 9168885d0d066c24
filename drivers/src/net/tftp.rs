//! TFTP client: read-only transfers in octet mode (RFC 1350).

use alloc::string::String;
use core::fmt;

use coopnet_lib::{klog_debug, klog_warn};

use super::netstack::NetStack;
use super::types::Ipv4Addr;
use super::udp::{UDP_PAYLOAD_SIZE, UdpPortHandler};

pub const TFTP_PORT: u16 = 69;

const OP_RRQ: u16 = 1;
const OP_DATA: u16 = 3;
const OP_ACK: u16 = 4;
const OP_ERROR: u16 = 5;

const TFTP_HEADER_LEN: usize = 4;
/// A DATA block shorter than this ends the transfer.
pub const TFTP_BLOCK_SIZE: usize = 512;
const TFTP_MAX_TRIES: usize = 5;
const TFTP_TIMEOUT_US: u64 = 3_000_000;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TftpError {
    /// A block never arrived.
    Timeout,
    /// The server sent an ERROR packet.
    Server { code: u16, message: String },
    /// The server sent something other than DATA or ERROR.
    UnknownOpcode(u16),
    /// The request does not fit in one datagram.
    FileNameTooLong,
}

impl fmt::Display for TftpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "Timeout"),
            Self::Server { code, message } => write!(f, "server error {}: {}", code, message),
            Self::UnknownOpcode(op) => write!(f, "Unknown opcode {} from server", op),
            Self::FileNameTooLong => write!(f, "file name too long"),
        }
    }
}

/// Write a read request for `file`.  Returns its length.
pub fn build_read_request(file: &str, out: &mut [u8]) -> Option<usize> {
    let mode = b"octet";
    let len = 2 + file.len() + 1 + mode.len() + 1;
    let out = out.get_mut(..len)?;
    out[0..2].copy_from_slice(&OP_RRQ.to_be_bytes());
    let (name, rest) = out[2..].split_at_mut(file.len());
    name.copy_from_slice(file.as_bytes());
    rest[0] = 0;
    rest[1..1 + mode.len()].copy_from_slice(mode);
    rest[1 + mode.len()] = 0;
    Some(len)
}

fn build_ack(block: u16, out: &mut [u8]) -> usize {
    out[0..2].copy_from_slice(&OP_ACK.to_be_bytes());
    out[2..4].copy_from_slice(&block.to_be_bytes());
    TFTP_HEADER_LEN
}

/// What a server datagram says.
#[derive(Debug, PartialEq, Eq)]
pub enum TftpPacket<'a> {
    Data { block: u16, data: &'a [u8] },
    Error { code: u16, message: &'a [u8] },
    Other(u16),
}

/// `None` for datagrams too short to carry a header.
pub fn parse_packet(payload: &[u8]) -> Option<TftpPacket<'_>> {
    if payload.len() < TFTP_HEADER_LEN {
        return None;
    }
    let op = u16::from_be_bytes([payload[0], payload[1]]);
    let arg = u16::from_be_bytes([payload[2], payload[3]]);
    let body = &payload[TFTP_HEADER_LEN..];
    Some(match op {
        OP_DATA => TftpPacket::Data { block: arg, data: body },
        OP_ERROR => {
            let end = body.iter().position(|&b| b == 0).unwrap_or(body.len());
            TftpPacket::Error {
                code: arg,
                message: &body[..end],
            }
        }
        other => TftpPacket::Other(other),
    })
}

impl NetStack {
    /// Fetch `file` from `server`, handing each block to `sink` in order.
    /// Returns the number of bytes received.
    pub async fn tftp_get<F>(
        &self,
        server: Ipv4Addr,
        file: &str,
        mut sink: F,
    ) -> Result<usize, TftpError>
    where
        F: FnMut(&[u8]),
    {
        let mut buf = self.pool().alloc();
        let len = build_read_request(file, &mut buf.udp_payload_mut()[..UDP_PAYLOAD_SIZE])
            .ok_or(TftpError::FileNameTooLong)?;
        let port = self.udp_alloc_port(UdpPortHandler::Enqueue);
        let result = self
            .tftp_transfer(&mut buf, len, server, port, &mut sink)
            .await;
        self.udp_free_port(port).await;
        match &result {
            Ok(total) => klog_debug!("tftp: {} bytes of {} from {}", total, file, server),
            Err(e) => klog_warn!("tftp: {} from {}: {}", file, server, e),
        }
        result
    }

    async fn tftp_transfer(
        &self,
        buf: &mut super::PacketBuf,
        mut len: usize,
        server: Ipv4Addr,
        port: u16,
        sink: &mut dyn FnMut(&[u8]),
    ) -> Result<usize, TftpError> {
        let mut dest_port = TFTP_PORT;
        let mut block: u16 = 1;
        let mut total = 0usize;
        loop {
            let mut tries = 0;
            let last = loop {
                if tries >= TFTP_MAX_TRIES {
                    return Err(TftpError::Timeout);
                }
                tries += 1;
                if let Err(e) = self.udp_send(buf, server, dest_port, port, len).await {
                    klog_debug!("tftp: send failed: {}", e);
                }
                let Ok(dgram) = self.udp_recv(port, TFTP_TIMEOUT_US).await else {
                    continue;
                };
                match parse_packet(dgram.payload()) {
                    Some(TftpPacket::Data { block: b, data }) if b == block => {
                        sink(data);
                        total += data.len();
                        dest_port = dgram.src().port;
                        break data.len() < TFTP_BLOCK_SIZE;
                    }
                    Some(TftpPacket::Data { .. }) | None => {}
                    Some(TftpPacket::Error { code, message }) => {
                        return Err(TftpError::Server {
                            code,
                            message: String::from_utf8_lossy(message).into_owned(),
                        });
                    }
                    Some(TftpPacket::Other(op)) => return Err(TftpError::UnknownOpcode(op)),
                }
            };
            len = build_ack(block, buf.udp_payload_mut());
            if last {
                // The final ACK is not retransmitted.
                if let Err(e) = self.udp_send(buf, server, dest_port, port, len).await {
                    klog_debug!("tftp: final ACK failed: {}", e);
                }
                return Ok(total);
            }
            block = block.wrapping_add(1);
        }
    }
}
