//! UDP: port registry, blocking receive queue, and send.
//!
//! A port is bound either to the shared receive queue, read with
//! [`NetStack::udp_recv`], or to an up-call run on the deliver thread.
//! Datagrams for unbound ports are answered with ICMP port-unreachable.
//! ICMP errors about datagrams we sent reach the source port as
//! [`UdpEvent::Problem`], or as an `Err` from `udp_recv`.

use alloc::boxed::Box;
use alloc::collections::{BTreeMap, VecDeque};
use core::fmt;

use coopnet_core::{Condition, LocalBoxFuture, Mutex, Scheduler};
use coopnet_lib::{klog_debug, klog_trace};

use super::icmp::{
    ICMP_CODE_PORT_UNREACHABLE, ICMP_TYPE_DEST_UNREACHABLE, ICMP_TYPE_TIME_EXCEEDED,
    embedded_packet,
};
use super::ipv4::ip_payload_checksum;
use super::netstack::NetStack;
use super::packetbuf::PacketBuf;
use super::types::{Ipv4Addr, NetError, SockAddr};
use super::{IP_PAYLOAD_SIZE, IPPROTO_ICMP, IPPROTO_UDP, IPV4_HEADER_LEN, UDP_HEADER_LEN, payload_checksum};

/// Largest UDP payload we send.
pub const UDP_PAYLOAD_SIZE: usize = IP_PAYLOAD_SIZE - UDP_HEADER_LEN;

/// Entries the shared receive queue holds across all ports; arrivals
/// beyond it are dropped.
pub const UDP_QUEUE_LIMIT: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UdpError {
    /// Nothing arrived in time.
    Timeout,
    /// No route or MAC address for the destination.
    HostUnreachable,
    /// The destination reported that nobody listens there.
    PortUnreachable,
}

impl UdpError {
    pub const fn to_code(&self) -> i32 {
        match self {
            Self::Timeout => -1,
            Self::HostUnreachable => -2,
            Self::PortUnreachable => -3,
        }
    }
}

impl fmt::Display for UdpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "receive timed out"),
            Self::HostUnreachable => write!(f, "host unreachable"),
            Self::PortUnreachable => write!(f, "port unreachable"),
        }
    }
}

/// What an up-call port receives.
pub enum UdpEvent<'a> {
    Datagram {
        buf: &'a mut PacketBuf,
        /// Payload length.
        len: usize,
        broadcast: bool,
    },
    Problem(UdpError),
}

/// Up-call bound to a port.  The `u16` is the local port.
pub type UdpReceiver = for<'a> fn(&'a NetStack, u16, UdpEvent<'a>) -> LocalBoxFuture<'a, ()>;

#[derive(Clone, Copy)]
pub enum UdpPortHandler {
    /// Queue datagrams for `udp_recv`.
    Enqueue,
    Handler(UdpReceiver),
}

impl fmt::Debug for UdpPortHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Enqueue => write!(f, "Enqueue"),
            Self::Handler(_) => write!(f, "Handler"),
        }
    }
}

/// A received datagram, owning a copy of the packet.
#[derive(Debug)]
pub struct UdpDatagram {
    buf: PacketBuf,
    len: usize,
}

impl UdpDatagram {
    /// Sender address and port.
    pub fn src(&self) -> SockAddr {
        SockAddr::new(self.buf.ip_src(), self.buf.udp_src_port())
    }

    pub fn dst(&self) -> SockAddr {
        SockAddr::new(self.buf.ip_dst(), self.buf.udp_dst_port())
    }

    pub fn payload(&self) -> &[u8] {
        let payload = self.buf.udp_payload();
        &payload[..self.len.min(payload.len())]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The whole packet, IP header included.
    pub fn packet(&self) -> &PacketBuf {
        &self.buf
    }
}

struct Queued {
    port: u16,
    result: Result<UdpDatagram, UdpError>,
}

pub(crate) struct UdpLayer {
    ports: spin::Mutex<BTreeMap<u16, UdpPortHandler>>,
    queue: Mutex<VecDeque<Queued>>,
    arrived: Condition,
}

impl UdpLayer {
    pub(crate) fn new(sched: &Scheduler) -> Self {
        Self {
            ports: spin::Mutex::new(BTreeMap::new()),
            queue: Mutex::new(sched, VecDeque::new()),
            arrived: Condition::new(sched),
        }
    }
}

/// IP up-call for UDP, and for ICMP errors about UDP.
pub(crate) fn udp_receive<'a>(
    stack: &'a NetStack,
    buf: &'a mut PacketBuf,
    broadcast: bool,
) -> LocalBoxFuture<'a, ()> {
    Box::pin(async move {
        if buf.ip_protocol() == IPPROTO_ICMP {
            let icmp_type = buf.ip_payload()[0];
            let port = {
                let inner = embedded_packet(buf);
                let Some(&first) = inner.first() else {
                    return;
                };
                let header_len = ((first & 0x0f) as usize * 4).max(IPV4_HEADER_LEN);
                match inner.get(header_len..header_len + 2) {
                    Some(p) => u16::from_be_bytes([p[0], p[1]]),
                    None => return,
                }
            };
            // Source quench and parameter problems are ignored.
            if icmp_type == ICMP_TYPE_DEST_UNREACHABLE || icmp_type == ICMP_TYPE_TIME_EXCEEDED {
                stack
                    .udp_deliver(port, UdpEvent::Problem(UdpError::PortUnreachable))
                    .await;
            }
            return;
        }

        let payload_len = buf.ip_payload_len();
        if payload_len < UDP_HEADER_LEN {
            klog_debug!("udp: runt datagram from {}", buf.ip_src());
            return;
        }
        let (udp_len, checksum) = {
            let h = buf.ip_payload();
            (
                u16::from_be_bytes([h[4], h[5]]) as usize,
                u16::from_be_bytes([h[6], h[7]]),
            )
        };
        if udp_len != payload_len {
            klog_debug!("udp: bad length {} in {}-byte payload", udp_len, payload_len);
            return;
        }
        if checksum != 0 && ip_payload_checksum(buf, udp_len) != 0 {
            klog_debug!("udp: bad checksum from {}", buf.ip_src());
            return;
        }
        let port = buf.udp_dst_port();
        klog_trace!("udp: {} bytes for port {}", udp_len - UDP_HEADER_LEN, port);
        stack
            .udp_deliver(
                port,
                UdpEvent::Datagram {
                    buf,
                    len: udp_len - UDP_HEADER_LEN,
                    broadcast,
                },
            )
            .await;
    })
}

impl NetStack {
    async fn udp_deliver(&self, port: u16, event: UdpEvent<'_>) {
        let handler = self.udp.ports.lock().get(&port).copied();
        match handler {
            Some(UdpPortHandler::Enqueue) => self.udp_enqueue(port, event).await,
            Some(UdpPortHandler::Handler(receiver)) => receiver(self, port, event).await,
            None => {
                if let UdpEvent::Datagram { buf, broadcast, .. } = event {
                    klog_debug!("udp: nobody on port {}", port);
                    self.icmp_bounce(
                        buf,
                        broadcast,
                        ICMP_TYPE_DEST_UNREACHABLE,
                        ICMP_CODE_PORT_UNREACHABLE,
                    )
                    .await;
                }
            }
        }
    }

    async fn udp_enqueue(&self, port: u16, event: UdpEvent<'_>) {
        let mut queue = self.udp.queue.lock().await;
        if queue.len() >= UDP_QUEUE_LIMIT {
            klog_debug!("udp: receive queue full, dropping arrival for port {}", port);
            return;
        }
        let result = match event {
            UdpEvent::Datagram { buf, len, .. } => Ok(UdpDatagram {
                buf: buf.duplicate(),
                len,
            }),
            UdpEvent::Problem(e) => Err(e),
        };
        queue.push_back(Queued { port, result });
        drop(queue);
        self.udp.arrived.broadcast();
    }

    /// Bind `port`, replacing any previous binding.
    pub fn udp_register(&self, port: u16, handler: UdpPortHandler) {
        self.udp.ports.lock().insert(port, handler);
    }

    /// Bind a random unused port above 1024 and return it.
    pub fn udp_alloc_port(&self, handler: UdpPortHandler) -> u16 {
        loop {
            let port = self.random_u16();
            if port <= 1024 {
                continue;
            }
            let mut ports = self.udp.ports.lock();
            if !ports.contains_key(&port) {
                ports.insert(port, handler);
                return port;
            }
        }
    }

    /// Unbind `port` and discard anything still queued for it.
    pub async fn udp_free_port(&self, port: u16) {
        self.udp.ports.lock().remove(&port);
        self.udp.queue.lock().await.retain(|q| q.port != port);
    }

    pub fn udp_port_bound(&self, port: u16) -> bool {
        self.udp.ports.lock().contains_key(&port)
    }

    /// Take the next datagram (or reported problem) queued for `port`,
    /// waiting at most `micros` (0 waits forever).
    pub async fn udp_recv(&self, port: u16, micros: u64) -> Result<UdpDatagram, UdpError> {
        let deadline = if micros > 0 {
            Some(self.now().saturating_add(micros))
        } else {
            None
        };
        let mut queue = self.udp.queue.lock().await;
        loop {
            let found = queue.iter().position(|q| q.port == port);
            if let Some(i) = found {
                return match queue.remove(i) {
                    Some(queued) => queued.result,
                    None => Err(UdpError::Timeout),
                };
            }
            let wait = match deadline {
                None => 0,
                Some(deadline) => {
                    let now = self.now();
                    if now >= deadline {
                        return Err(UdpError::Timeout);
                    }
                    deadline - now
                }
            };
            queue = self.udp.arrived.timed_wait(queue, wait).await.0;
        }
    }

    /// Send `len` bytes already written at [`PacketBuf::udp_payload_mut`]
    /// from `src_port` to `dest:dest_port`.
    pub async fn udp_send(
        &self,
        buf: &mut PacketBuf,
        dest: Ipv4Addr,
        dest_port: u16,
        src_port: u16,
        len: usize,
    ) -> Result<(), NetError> {
        if len > UDP_PAYLOAD_SIZE {
            return Err(NetError::MessageTooLong);
        }
        buf.init_ip(IPPROTO_UDP, dest);
        self.ip_set_source(buf);
        let src = buf.ip_src();
        let udp_len = UDP_HEADER_LEN + len;
        let segment = &mut buf.tx_payload_mut()[..udp_len];
        segment[0..2].copy_from_slice(&src_port.to_be_bytes());
        segment[2..4].copy_from_slice(&dest_port.to_be_bytes());
        segment[4..6].copy_from_slice(&(udp_len as u16).to_be_bytes());
        segment[6..8].fill(0);
        let sum = match payload_checksum(src, dest, IPPROTO_UDP, segment) {
            0 => 0xffff,
            sum => sum,
        };
        segment[6..8].copy_from_slice(&sum.to_be_bytes());
        self.ip_send(buf, udp_len, 0, 0).await
    }
}
