//! TCP connections: listen, accept, connect, send, receive and teardown.
//!
//! # Locking
//!
//! One blocking mutex guards every connection, the listener table and the
//! connection index.  Client calls, the receive up-call and the
//! retransmitter all take it, so state transitions are serialized.  Six
//! conditions (accept, connect, recv, close, create, send) are shared by
//! all connections; a woken waiter rechecks its own connection.
//!
//! # Connections
//!
//! Connections live in a generation-checked slab and are found by
//! `(local port, remote address, remote port)`.  A [`TcpHandle`] is handed
//! to the client by `tcp_accept` or `tcp_connect` and consumed by
//! `tcp_close`; using a connection after it was freed is a programming
//! error and panics.
//!
//! Outgoing data is aggregated in the *tail* element until a segment is
//! full or the client pushes.  Sent elements wait on the unacknowledged
//! queue for the retransmitter.  Received bytes go into a ring buffer;
//! segments beyond a gap wait on the out-of-order queue, in arrival order,
//! until the gap closes.

use alloc::boxed::Box;
use alloc::collections::{BTreeMap, VecDeque};
use alloc::vec::Vec;
use core::fmt;
use core::mem;

use coopnet_core::{Condition, LocalBoxFuture, Mutex, MutexGuard, Scheduler};
use coopnet_lib::{RingBuffer, klog_debug, klog_info, klog_trace};

use super::config::TcpTuning;
use super::ipv4::{ip_payload_checksum, is_broadcast_for};
use super::netstack::NetStack;
use super::packetbuf::PacketBuf;
use super::tcp::{
    TCP_HEADER_LEN, TCP_MSS, TcpError, TcpFlags, TcpHeader, TcpState, build_header,
    parse_header, parse_mss_option, seq_ge, seq_gt, seq_le, seq_lt, write_header,
    write_mss_option,
};
use super::types::{Ipv4Addr, SockAddr};
use super::{IP_PAYLOAD_SIZE, IPPROTO_ICMP, IPPROTO_TCP, IPV4_HEADER_LEN, payload_checksum};

/// Capacity of each connection's receive ring; the advertised window never
/// exceeds it.
pub const RECV_BUF_SIZE: usize = 8000;

/// Segments held for reassembly per connection; later ones are dropped and
/// left to the peer's retransmission.
const OUT_OF_ORDER_LIMIT: usize = 32;

/// Bytes of segment payload that fit after the TCP header in one packet.
const SEGMENT_SPACE: usize = IP_PAYLOAD_SIZE - TCP_HEADER_LEN;

type ConnKey = (u16, Ipv4Addr, u16);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct ConnId {
    slot: usize,
    generation: u32,
}

/// Client's claim on a connection.  Move-only: `tcp_close` consumes it.
pub struct TcpHandle {
    id: ConnId,
    local_port: u16,
    remote: SockAddr,
}

impl TcpHandle {
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn remote(&self) -> SockAddr {
        self.remote
    }
}

impl fmt::Debug for TcpHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TcpHandle {{ slot={}, :{} -> {} }}",
            self.id.slot, self.local_port, self.remote
        )
    }
}

/// The per-segment header fields that come from the connection.
#[derive(Clone, Copy)]
struct Endpoint {
    local_port: u16,
    remote_addr: Ipv4Addr,
    remote_port: u16,
    recv_next: u32,
    recv_window: u32,
}

/// One segment's worth of outgoing data.
struct TransmitElem {
    buf: PacketBuf,
    len: usize,
    seq: u32,
    /// PSH or FIN, in addition to ACK.
    flag: TcpFlags,
    sent_at: u64,
    first_sent_at: u64,
}

impl TransmitElem {
    fn new(buf: PacketBuf, seq: u32) -> Self {
        Self {
            buf,
            len: 0,
            seq,
            flag: TcpFlags::empty(),
            sent_at: 0,
            first_sent_at: 0,
        }
    }

    /// Sequence space covered, FIN included.
    fn end(&self) -> u32 {
        let fin = self.flag.contains(TcpFlags::FIN) as u32;
        self.seq.wrapping_add(self.len as u32).wrapping_add(fin)
    }
}

struct TcpConn {
    local_port: u16,
    remote_addr: Ipv4Addr,
    remote_port: u16,
    state: TcpState,
    /// The connection ended because the peer sent RST.
    reset_by_peer: bool,
    created_at: u64,

    send_init: u32,
    /// Next sequence number for the transmit queue.
    send_next: u32,
    send_unack: u32,
    /// Relative to `send_unack`.
    send_window: u32,
    /// Largest segment the peer takes, from its SYN.
    send_mss: usize,
    /// A push was held back because data is in flight.
    send_nagled: bool,
    /// Next sequence number to go on the wire.
    transmitted: u32,

    recv_init: u32,
    recv_next: u32,
    recv_window: u32,

    unacked: VecDeque<TransmitElem>,
    tail: TransmitElem,
    /// Allocated when the first byte arrives.
    recv_buf: Option<Box<RingBuffer<u8, RECV_BUF_SIZE>>>,
    /// The last byte received carried PSH.
    recv_pushed: bool,
    out_of_order: VecDeque<PacketBuf>,
}

impl TcpConn {
    /// A connection whose SYN (real or pretend) has consumed `iss`.
    fn new(key: ConnKey, iss: u32, window: u32, tail: PacketBuf, now: u64) -> Self {
        let (local_port, remote_addr, remote_port) = key;
        let next = iss.wrapping_add(1);
        Self {
            local_port,
            remote_addr,
            remote_port,
            state: TcpState::SynSent,
            reset_by_peer: false,
            created_at: now,
            send_init: iss,
            send_next: next,
            send_unack: iss,
            send_window: 0,
            send_mss: SEGMENT_SPACE,
            send_nagled: false,
            transmitted: next,
            recv_init: 0,
            recv_next: 0,
            recv_window: window,
            unacked: VecDeque::new(),
            tail: TransmitElem::new(tail, next),
            recv_buf: None,
            recv_pushed: false,
            out_of_order: VecDeque::new(),
        }
    }

    fn endpoint(&self) -> Endpoint {
        Endpoint {
            local_port: self.local_port,
            remote_addr: self.remote_addr,
            remote_port: self.remote_port,
            recv_next: self.recv_next,
            recv_window: self.recv_window,
        }
    }

    fn buffered(&self) -> usize {
        self.recv_buf.as_ref().map_or(0, |ring| ring.len() as usize)
    }

    /// Drop elements acknowledged by `send_unack`.
    fn prune(&mut self) {
        while let Some(elem) = self.unacked.front() {
            if seq_lt(self.send_unack, elem.end()) {
                break;
            }
            self.unacked.pop_front();
        }
    }
}

struct Listener {
    /// Zero accepts any peer address.
    remote_addr: Ipv4Addr,
    /// Zero accepts any peer port.
    remote_port: u16,
    backlog: usize,
    /// Connections not yet accepted, oldest first.
    pending: VecDeque<ConnId>,
}

impl Listener {
    fn admits(&self, addr: Ipv4Addr, port: u16) -> bool {
        (self.remote_addr.is_unspecified() || self.remote_addr == addr)
            && (self.remote_port == 0 || self.remote_port == port)
    }
}

struct ConnSlot {
    generation: u32,
    conn: Option<TcpConn>,
}

struct TcpInner {
    slots: Vec<ConnSlot>,
    free: Vec<usize>,
    index: BTreeMap<ConnKey, ConnId>,
    listeners: BTreeMap<u16, Listener>,
}

impl TcpInner {
    fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            index: BTreeMap::new(),
            listeners: BTreeMap::new(),
        }
    }

    fn insert(&mut self, conn: TcpConn) -> ConnId {
        let key = (conn.local_port, conn.remote_addr, conn.remote_port);
        let slot = match self.free.pop() {
            Some(slot) => slot,
            None => {
                self.slots.push(ConnSlot {
                    generation: 0,
                    conn: None,
                });
                self.slots.len() - 1
            }
        };
        self.slots[slot].conn = Some(conn);
        let id = ConnId {
            slot,
            generation: self.slots[slot].generation,
        };
        self.index.insert(key, id);
        id
    }

    fn get(&self, id: ConnId) -> Option<&TcpConn> {
        self.slots
            .get(id.slot)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.conn.as_ref())
    }

    fn get_mut(&mut self, id: ConnId) -> Option<&mut TcpConn> {
        self.slots
            .get_mut(id.slot)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.conn.as_mut())
    }

    /// The connection behind a client handle.
    fn conn(&mut self, handle: &TcpHandle) -> &mut TcpConn {
        match self.get_mut(handle.id) {
            Some(conn) => conn,
            None => panic!("tcp: {:?} used after its connection was freed", handle),
        }
    }

    fn find(&self, key: ConnKey) -> Option<ConnId> {
        self.index.get(&key).copied()
    }

    /// Free a connection and everything it holds.
    fn remove(&mut self, id: ConnId) {
        let Some(slot) = self.slots.get_mut(id.slot) else {
            return;
        };
        if slot.generation != id.generation {
            return;
        }
        if let Some(conn) = slot.conn.take() {
            let key = (conn.local_port, conn.remote_addr, conn.remote_port);
            if self.index.get(&key) == Some(&id) {
                self.index.remove(&key);
            }
            slot.generation = slot.generation.wrapping_add(1);
            self.free.push(id.slot);
        }
    }

    fn ids(&self) -> Vec<ConnId> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.conn.is_some())
            .map(|(slot, s)| ConnId {
                slot,
                generation: s.generation,
            })
            .collect()
    }

    fn live(&self) -> usize {
        self.index.len()
    }

    /// Free pending connections that died before being accepted.
    fn reap_pending(&mut self, port: u16) {
        let Some(listener) = self.listeners.get(&port) else {
            return;
        };
        let dead: Vec<ConnId> = listener
            .pending
            .iter()
            .copied()
            .filter(|&id| self.get(id).is_none_or(|c| c.state.is_closed()))
            .collect();
        if dead.is_empty() {
            return;
        }
        if let Some(listener) = self.listeners.get_mut(&port) {
            listener.pending.retain(|id| !dead.contains(id));
        }
        for id in dead {
            self.remove(id);
        }
    }

    /// Take the oldest established connection waiting on `port`.
    fn take_accepted(&mut self, port: u16) -> Result<Option<ConnId>, TcpError> {
        self.reap_pending(port);
        let Some(listener) = self.listeners.get(&port) else {
            return Err(TcpError::Refused);
        };
        let ready = listener
            .pending
            .iter()
            .position(|&id| self.get(id).is_some_and(|c| !c.state.is_synchronizing()));
        let Some(i) = ready else {
            return Ok(None);
        };
        Ok(self
            .listeners
            .get_mut(&port)
            .and_then(|listener| listener.pending.remove(i)))
    }
}

pub(crate) struct TcpLayer {
    inner: Mutex<TcpInner>,
    accept: Condition,
    connect: Condition,
    recv: Condition,
    close: Condition,
    create: Condition,
    send: Condition,
}

impl TcpLayer {
    pub(crate) fn new(sched: &Scheduler) -> Self {
        Self {
            inner: Mutex::new(sched, TcpInner::new()),
            accept: Condition::new(sched),
            connect: Condition::new(sched),
            recv: Condition::new(sched),
            close: Condition::new(sched),
            create: Condition::new(sched),
            send: Condition::new(sched),
        }
    }

    /// Wake everyone who might be waiting on a connection that just died.
    fn wake_all(&self) {
        self.accept.broadcast();
        self.connect.broadcast();
        self.send.broadcast();
        self.recv.broadcast();
        self.close.broadcast();
    }
}

/// Largest window we advertise.
fn recv_limit(tuning: &TcpTuning) -> u32 {
    tuning.max_recv_window.min(RECV_BUF_SIZE as u32)
}

/// Microseconds left before `deadline`: `Some(0)` for no deadline, `None`
/// once it has passed.
fn wait_budget(now: u64, deadline: Option<u64>) -> Option<u64> {
    match deadline {
        None => Some(0),
        Some(deadline) if now < deadline => Some(deadline - now),
        Some(_) => None,
    }
}

struct Segment<'a> {
    hdr: TcpHeader,
    payload: &'a [u8],
}

impl Segment<'_> {
    /// Sequence space after the last byte, SYN and FIN counted.
    fn end(&self) -> u32 {
        let syn = self.hdr.has(TcpFlags::SYN) as u32;
        let fin = self.hdr.has(TcpFlags::FIN) as u32;
        self.hdr
            .seq_num
            .wrapping_add(self.payload.len() as u32)
            .wrapping_add(syn)
            .wrapping_add(fin)
    }
}

fn segment_of(buf: &PacketBuf) -> Option<Segment<'_>> {
    let data = buf.ip_payload();
    let hdr = parse_header(data)?;
    let payload = data.get(hdr.header_len()..)?;
    Some(Segment { hdr, payload })
}

/// Take in-order payload and FIN from `seg`.  Returns whether the whole
/// segment has now been consumed.
fn process_data(conn: &mut TcpConn, seg: &Segment<'_>, limit: u32, now: u64) -> bool {
    let hdr = &seg.hdr;
    let mut seq = hdr.seq_num;
    if hdr.has(TcpFlags::SYN) {
        seq = seq.wrapping_add(1);
    }
    if seq_le(seq, conn.recv_next) {
        let base = conn.recv_next.wrapping_sub(seq) as usize;
        let useful = seg.payload.get(base..).unwrap_or(&[]);
        let room = (limit as usize).saturating_sub(conn.buffered());
        let amount = useful.len().min(room);
        if amount > 0 {
            let ring = conn
                .recv_buf
                .get_or_insert_with(|| Box::new(RingBuffer::new()));
            ring.write_slice(&useful[..amount]);
            let buffered = ring.len();
            conn.recv_next = conn.recv_next.wrapping_add(amount as u32);
            conn.recv_window = limit.saturating_sub(buffered);
        }
        // An empty push has nothing to flush; `tcp_recv` returning 0 must
        // still mean end of stream.
        conn.recv_pushed =
            hdr.has(TcpFlags::PSH) && amount == useful.len() && conn.buffered() > 0;
    }
    seq = seq.wrapping_add(seg.payload.len() as u32);
    if hdr.has(TcpFlags::FIN) {
        if seq == conn.recv_next {
            conn.state = match conn.state {
                TcpState::Established => TcpState::CloseWait,
                TcpState::FinWait1 => TcpState::Closing,
                TcpState::FinWait2 => TcpState::TimeWait { since: now },
                other => other,
            };
            conn.recv_next = conn.recv_next.wrapping_add(1);
        }
        seq = seq.wrapping_add(1);
    }
    seq_le(seq, conn.recv_next)
}

enum PassiveOpen {
    Opened(ConnId),
    Refused,
    Dropped,
}

/// IP up-call for TCP segments and ICMP errors about them.
pub(crate) fn tcp_receive<'a>(
    stack: &'a NetStack,
    buf: &'a mut PacketBuf,
    broadcast: bool,
) -> LocalBoxFuture<'a, ()> {
    Box::pin(async move {
        if buf.ip_protocol() == IPPROTO_ICMP {
            klog_debug!(
                "tcp: ignoring ICMP type {} from {}",
                buf.ip_payload().first().copied().unwrap_or(0),
                buf.ip_src()
            );
            return;
        }
        if broadcast {
            klog_debug!("tcp: dropping broadcast segment from {}", buf.ip_src());
            return;
        }
        let len = buf.ip_payload_len();
        if ip_payload_checksum(buf, len) != 0 {
            klog_debug!("tcp: bad checksum, {} bytes from {}", len, buf.ip_src());
            return;
        }
        stack.tcp_segment_arrived(buf).await;
    })
}

impl NetStack {
    // =========================================================================
    // Transmission
    // =========================================================================

    /// Build and send a segment whose `len` payload bytes are already in
    /// `buf` after a bare TCP header.  A SYN without payload carries the
    /// MSS option.
    async fn tcp_emit(&self, buf: &mut PacketBuf, ep: Endpoint, len: usize, seq: u32, flags: TcpFlags) {
        buf.init_ip(IPPROTO_TCP, ep.remote_addr);
        self.ip_set_source(buf);
        let src = buf.ip_src();
        let with_mss = flags.contains(TcpFlags::SYN) && len == 0;
        let header_len = if with_mss {
            TCP_HEADER_LEN + 4
        } else {
            TCP_HEADER_LEN
        };
        let hdr = build_header(
            ep.local_port,
            ep.remote_port,
            seq,
            ep.recv_next,
            flags,
            ep.recv_window.min(u16::MAX as u32) as u16,
            (header_len / 4) as u8,
        );
        let segment = &mut buf.tx_payload_mut()[..header_len + len];
        if write_header(&hdr, segment).is_none() {
            return;
        }
        if with_mss {
            write_mss_option(TCP_MSS as u16, &mut segment[TCP_HEADER_LEN..]);
        }
        let sum = payload_checksum(src, ep.remote_addr, IPPROTO_TCP, segment);
        segment[16..18].copy_from_slice(&sum.to_be_bytes());
        klog_trace!(
            "tcp: :{} -> {}:{} seq={} ack={} flags={:?} len={}",
            ep.local_port,
            ep.remote_addr,
            ep.remote_port,
            seq,
            ep.recv_next,
            flags,
            len
        );
        if let Err(e) = self.ip_send(buf, header_len + len, 0, 0).await {
            klog_debug!("tcp: send to {} failed: {}", ep.remote_addr, e);
        }
    }

    /// Send a segment without payload: SYN, ACK, RST and the like.
    async fn tcp_send_small(&self, ep: Endpoint, seq: u32, flags: TcpFlags) {
        let mut buf = self.pool().alloc();
        self.tcp_emit(&mut buf, ep, 0, seq, flags).await;
    }

    async fn tcp_transmit_elem(&self, elem: &mut TransmitElem, ep: Endpoint) {
        self.tcp_emit(&mut elem.buf, ep, elem.len, elem.seq, TcpFlags::ACK | elem.flag)
            .await;
        elem.sent_at = self.now();
    }

    /// Transmit the tail element, queue it for retransmission and start a
    /// new tail.  An empty push covers no sequence space and is not queued.
    async fn tcp_send_data(&self, conn: &mut TcpConn) {
        let ep = conn.endpoint();
        self.tcp_transmit_elem(&mut conn.tail, ep).await;
        conn.tail.first_sent_at = conn.tail.sent_at;
        conn.transmitted = conn.tail.end();
        conn.send_nagled = false;
        let next = TransmitElem::new(self.pool().alloc(), conn.send_next);
        let sent = mem::replace(&mut conn.tail, next);
        if sent.end() != sent.seq {
            conn.unacked.push_back(sent);
        }
    }

    /// Reset the connection unless it never got going, and mark it dead.
    async fn tcp_abort_conn(&self, conn: &mut TcpConn) {
        if matches!(
            conn.state,
            TcpState::SynReceived
                | TcpState::Established
                | TcpState::FinWait1
                | TcpState::FinWait2
                | TcpState::CloseWait
        ) {
            self.tcp_send_small(conn.endpoint(), conn.transmitted, TcpFlags::RST | TcpFlags::ACK)
                .await;
        }
        conn.state = TcpState::Closed { failed: true };
        self.tcp.wake_all();
    }

    fn tcp_new_conn(&self, key: ConnKey, tuning: &TcpTuning) -> TcpConn {
        TcpConn::new(
            key,
            self.random_u32(),
            recv_limit(tuning),
            self.pool().alloc(),
            self.now(),
        )
    }

    fn tcp_insert(&self, inner: &mut TcpInner, conn: TcpConn) -> ConnId {
        if inner.live() == 0 {
            self.tcp.create.broadcast();
        }
        inner.insert(conn)
    }

    // =========================================================================
    // Reception
    // =========================================================================

    async fn tcp_segment_arrived(&self, buf: &PacketBuf) {
        let src = buf.ip_src();
        let Some(seg) = segment_of(buf) else {
            klog_debug!("tcp: malformed header from {}", src);
            return;
        };
        let key = (seg.hdr.dst_port, src, seg.hdr.src_port);
        let tuning = self.config().tcp;
        let limit = recv_limit(&tuning);

        let mut guard = self.tcp.inner.lock().await;
        let inner = &mut *guard;
        let mut id = inner.find(key);
        if id.is_none() && seg.hdr.flags == TcpFlags::SYN {
            match self.tcp_passive_open(inner, key, &tuning) {
                PassiveOpen::Opened(new) => id = Some(new),
                PassiveOpen::Refused => {}
                PassiveOpen::Dropped => return,
            }
        }
        let conn = match id.and_then(|id| inner.get_mut(id)) {
            Some(conn) if !conn.state.is_closed() => conn,
            _ => {
                self.tcp_reject_unknown(src, &seg, limit).await;
                return;
            }
        };

        let before = (conn.state, conn.recv_next);
        let now = self.now();
        let Some(mut should_ack) = self.tcp_process_incoming(conn, buf, &seg, limit, now).await
        else {
            return;
        };

        // Arrival order is usually, but not always, sequence order: keep
        // rescanning until a pass makes no progress.
        let mut progress = conn.recv_next != before.1;
        while progress && conn.state.accepts_data() {
            progress = false;
            let queued = mem::take(&mut conn.out_of_order);
            for pkt in queued {
                let consumed = match segment_of(&pkt) {
                    Some(seg) => process_data(conn, &seg, limit, now),
                    None => true,
                };
                if consumed {
                    should_ack = true;
                    progress = true;
                } else {
                    conn.out_of_order.push_back(pkt);
                }
            }
        }

        if conn.state != before.0 || conn.recv_next != before.1 {
            self.tcp.recv.broadcast();
        }
        if conn.state != before.0 {
            self.tcp.close.broadcast();
        }

        if conn.send_nagled && conn.send_unack == conn.transmitted {
            self.tcp_send_data(conn).await;
        } else if should_ack {
            self.tcp_send_small(conn.endpoint(), conn.transmitted, TcpFlags::ACK)
                .await;
        }
    }

    /// A bare SYN for an unknown connection: open one if a listener wants
    /// it.  The new connection pretends its SYN has been sent, so the
    /// incoming SYN is answered with SYN+ACK.
    fn tcp_passive_open(&self, inner: &mut TcpInner, key: ConnKey, tuning: &TcpTuning) -> PassiveOpen {
        let (port, addr, remote_port) = key;
        inner.reap_pending(port);
        let Some(listener) = inner.listeners.get(&port) else {
            return PassiveOpen::Refused;
        };
        if !listener.admits(addr, remote_port) {
            klog_debug!("tcp: port {} does not accept {}:{}", port, addr, remote_port);
            return PassiveOpen::Refused;
        }
        if listener.pending.len() >= listener.backlog.max(1) {
            klog_debug!("tcp: backlog full on port {}, dropping SYN from {}", port, addr);
            return PassiveOpen::Dropped;
        }
        let conn = self.tcp_new_conn(key, tuning);
        let id = self.tcp_insert(inner, conn);
        if let Some(listener) = inner.listeners.get_mut(&port) {
            listener.pending.push_back(id);
        }
        klog_debug!("tcp: passive open :{} <- {}:{}", port, addr, remote_port);
        PassiveOpen::Opened(id)
    }

    /// Answer a segment for no live connection with RST.
    async fn tcp_reject_unknown(&self, src: Ipv4Addr, seg: &Segment<'_>, limit: u32) {
        let hdr = &seg.hdr;
        if hdr.has(TcpFlags::RST) {
            return;
        }
        klog_debug!("tcp: rejecting segment {}:{} -> :{}", src, hdr.src_port, hdr.dst_port);
        let mut ep = Endpoint {
            local_port: hdr.dst_port,
            remote_addr: src,
            remote_port: hdr.src_port,
            recv_next: 0,
            recv_window: limit,
        };
        if hdr.has(TcpFlags::ACK) {
            self.tcp_send_small(ep, hdr.ack_num, TcpFlags::RST).await;
        } else {
            ep.recv_next = seg.end();
            self.tcp_send_small(ep, 0, TcpFlags::RST | TcpFlags::ACK).await;
        }
    }

    /// Apply one segment to a live connection.  `None` means the segment
    /// was refused or killed the connection; otherwise says whether an ACK
    /// is due.
    async fn tcp_process_incoming(
        &self,
        conn: &mut TcpConn,
        buf: &PacketBuf,
        seg: &Segment<'_>,
        limit: u32,
        now: u64,
    ) -> Option<bool> {
        let hdr = &seg.hdr;
        let ack = hdr.ack_num;
        let mut should_ack =
            !seg.payload.is_empty() || hdr.has(TcpFlags::SYN) || hdr.has(TcpFlags::FIN);

        if hdr.has(TcpFlags::ACK) {
            if seq_ge(ack, conn.send_unack) && seq_le(ack, conn.transmitted) {
                conn.send_unack = ack;
                conn.prune();
            } else if conn.state.is_synchronizing() {
                klog_debug!("tcp: unacceptable ACK {} before established", ack);
                if !hdr.has(TcpFlags::RST) {
                    self.tcp_send_small(conn.endpoint(), ack, TcpFlags::RST).await;
                }
                return None;
            } else {
                // Old, bogus, or a keep-alive.
                should_ack = true;
            }
        }

        if hdr.has(TcpFlags::RST) {
            klog_debug!(
                "tcp: reset by {}:{} in {}",
                conn.remote_addr,
                conn.remote_port,
                conn.state
            );
            conn.state = TcpState::Closed { failed: true };
            conn.reset_by_peer = true;
            self.tcp.wake_all();
            return None;
        }

        if hdr.has(TcpFlags::SYN) {
            if conn.state == TcpState::SynSent {
                let options = buf.ip_payload().get(TCP_HEADER_LEN..hdr.header_len());
                if let Some(mss) = options.and_then(parse_mss_option) {
                    conn.send_mss = (mss as usize).clamp(1, SEGMENT_SPACE);
                }
                conn.recv_init = hdr.seq_num;
                conn.recv_next = hdr.seq_num.wrapping_add(1);
                if conn.send_unack == conn.send_init {
                    // Passive open, or simultaneous open: (re)send our SYN
                    // with the ACK.
                    self.tcp_send_small(
                        conn.endpoint(),
                        conn.send_init,
                        TcpFlags::SYN | TcpFlags::ACK,
                    )
                    .await;
                    should_ack = false;
                }
                conn.state = TcpState::SynReceived;
            } else if hdr.seq_num != conn.recv_init {
                klog_debug!("tcp: out-of-sequence SYN from {}", conn.remote_addr);
                return None;
            }
        }

        let all_acked = conn.send_unack == conn.send_next;
        match conn.state {
            TcpState::SynSent => should_ack = false,
            TcpState::SynReceived => {
                if conn.send_unack != conn.send_init {
                    conn.state = TcpState::Established;
                    klog_debug!(
                        "tcp: established :{} <-> {}:{}",
                        conn.local_port,
                        conn.remote_addr,
                        conn.remote_port
                    );
                    self.tcp.accept.broadcast();
                    self.tcp.connect.broadcast();
                } else {
                    should_ack = false;
                }
            }
            TcpState::FinWait1 if all_acked => {
                conn.state = TcpState::FinWait2;
                self.tcp.close.broadcast();
            }
            TcpState::Closing if all_acked => {
                conn.state = TcpState::TimeWait { since: now };
                self.tcp.close.broadcast();
            }
            TcpState::LastAck => {
                if all_acked {
                    conn.state = TcpState::Closed { failed: false };
                    self.tcp.close.broadcast();
                }
                should_ack = false;
            }
            _ => {}
        }

        if conn.state.can_send() {
            conn.send_window = hdr.window_size as u32;
            self.tcp.send.broadcast();
        }

        if conn.state.accepts_data() && !process_data(conn, seg, limit, now) {
            let worth_keeping = !seg.payload.is_empty() || hdr.has(TcpFlags::FIN);
            if worth_keeping && conn.out_of_order.len() < OUT_OF_ORDER_LIMIT {
                conn.out_of_order.push_back(buf.duplicate());
            }
        }
        Some(should_ack)
    }

    // =========================================================================
    // Retransmission
    // =========================================================================

    /// Body of the retransmitter thread.  Every interval it resends each
    /// connection's SYN or oldest unacknowledged segment, kills connections
    /// that have waited too long and frees closed ones past TIME_WAIT.
    pub(crate) async fn tcp_retransmitter(&self) {
        loop {
            {
                let mut inner = self.tcp.inner.lock().await;
                while inner.live() == 0 {
                    inner = self.tcp.create.wait(inner).await;
                }
            }
            let tuning = self.config().tcp;
            self.scheduler().sleep(tuning.retransmit_interval_us).await;

            let mut inner = self.tcp.inner.lock().await;
            for id in inner.ids() {
                self.tcp_retransmit_one(&mut inner, id, &tuning).await;
            }
        }
    }

    async fn tcp_retransmit_one(
        &self,
        inner: &mut MutexGuard<'_, TcpInner>,
        id: ConnId,
        tuning: &TcpTuning,
    ) {
        let now = self.now();
        let Some(conn) = inner.get_mut(id) else {
            return;
        };
        let state = conn.state;
        match state {
            TcpState::SynSent | TcpState::SynReceived
                if now.saturating_sub(conn.created_at) > tuning.abort_after_us =>
            {
                klog_info!("tcp: handshake with {} timed out", conn.remote_addr);
                self.tcp_abort_conn(conn).await;
            }
            TcpState::SynSent => {
                self.tcp_send_small(conn.endpoint(), conn.send_init, TcpFlags::SYN)
                    .await;
            }
            TcpState::SynReceived => {
                self.tcp_send_small(
                    conn.endpoint(),
                    conn.send_init,
                    TcpFlags::SYN | TcpFlags::ACK,
                )
                .await;
            }
            TcpState::Closed { .. } => {}
            TcpState::TimeWaitClosed { since } => {
                if now.saturating_sub(since) >= tuning.time_wait_us {
                    klog_debug!("tcp: freeing :{} after TIME_WAIT", conn.local_port);
                    inner.remove(id);
                }
            }
            _ => {
                let ep = conn.endpoint();
                let Some(head) = conn.unacked.front_mut() else {
                    return;
                };
                if now.saturating_sub(head.first_sent_at) > tuning.abort_after_us {
                    klog_info!(
                        "tcp: {}:{} stopped acknowledging, aborting",
                        conn.remote_addr,
                        conn.remote_port
                    );
                    self.tcp_abort_conn(conn).await;
                } else {
                    klog_debug!("tcp: retransmitting seq {} to {}", head.seq, ep.remote_addr);
                    self.tcp_transmit_elem(head, ep).await;
                }
            }
        }
    }

    // =========================================================================
    // Client interface
    // =========================================================================

    /// Accept connections on `local_port` from peers matching the filter
    /// (zero address or port matches anything), keeping at most `backlog`
    /// (at least one) waiting for `tcp_accept`.  Calling again updates the
    /// filter and backlog.  A negative `backlog` stops listening and aborts
    /// every connection not yet accepted.
    pub async fn tcp_listen(&self, local_port: u16, remote_addr: Ipv4Addr, remote_port: u16, backlog: i32) {
        let mut inner = self.tcp.inner.lock().await;
        if backlog < 0 {
            let Some(listener) = inner.listeners.remove(&local_port) else {
                return;
            };
            klog_info!("tcp: no longer listening on port {}", local_port);
            for id in listener.pending {
                if let Some(conn) = inner.get_mut(id) {
                    self.tcp_abort_conn(conn).await;
                }
                inner.remove(id);
            }
            self.tcp.accept.broadcast();
            return;
        }
        let listener = inner.listeners.entry(local_port).or_insert_with(|| Listener {
            remote_addr,
            remote_port,
            backlog: 0,
            pending: VecDeque::new(),
        });
        listener.remote_addr = remote_addr;
        listener.remote_port = remote_port;
        listener.backlog = backlog as usize;
        klog_info!("tcp: listening on port {} (backlog {})", local_port, backlog);
    }

    /// Wait for an established connection on a listening port.  `micros` 0
    /// waits forever.
    pub async fn tcp_accept(&self, local_port: u16, micros: u64) -> Result<(TcpHandle, SockAddr), TcpError> {
        let deadline = (micros > 0).then(|| self.now().saturating_add(micros));
        let mut inner = self.tcp.inner.lock().await;
        loop {
            if let Some(id) = inner.take_accepted(local_port)? {
                let Some(conn) = inner.get(id) else {
                    continue;
                };
                let remote = SockAddr::new(conn.remote_addr, conn.remote_port);
                let handle = TcpHandle {
                    id,
                    local_port,
                    remote,
                };
                return Ok((handle, remote));
            }
            let Some(budget) = wait_budget(self.now(), deadline) else {
                return Err(TcpError::TimedOut);
            };
            inner = self.tcp.accept.timed_wait(inner, budget).await.0;
        }
    }

    /// Open a connection from `local_port` (0 picks a free port above 1024)
    /// and wait for it to be established.  `micros` 0 waits forever.
    pub async fn tcp_connect(
        &self,
        local_port: u16,
        remote_addr: Ipv4Addr,
        remote_port: u16,
        micros: u64,
    ) -> Result<TcpHandle, TcpError> {
        if remote_addr.is_unspecified()
            || remote_port == 0
            || is_broadcast_for(&self.config(), remote_addr)
        {
            return Err(TcpError::InvalidState);
        }
        let tuning = self.config().tcp;
        let deadline = (micros > 0).then(|| self.now().saturating_add(micros));

        let mut inner = self.tcp.inner.lock().await;
        let local_port = if local_port == 0 {
            loop {
                let port = self.random_u16();
                if port > 1024 && inner.find((port, remote_addr, remote_port)).is_none() {
                    break port;
                }
            }
        } else {
            if inner.find((local_port, remote_addr, remote_port)).is_some() {
                return Err(TcpError::AddrInUse);
            }
            local_port
        };
        let key = (local_port, remote_addr, remote_port);
        let conn = self.tcp_new_conn(key, &tuning);
        let (ep, iss) = (conn.endpoint(), conn.send_init);
        let id = self.tcp_insert(&mut inner, conn);
        klog_debug!("tcp: connecting :{} -> {}:{}", local_port, remote_addr, remote_port);
        self.tcp_send_small(ep, iss, TcpFlags::SYN).await;

        loop {
            let synchronizing = inner.get(id).is_some_and(|c| c.state.is_synchronizing());
            if !synchronizing {
                break;
            }
            let Some(budget) = wait_budget(self.now(), deadline) else {
                break;
            };
            inner = self.tcp.connect.timed_wait(inner, budget).await.0;
        }

        let outcome = inner.get(id).map(|c| (c.state, c.reset_by_peer));
        match outcome {
            Some((state, _)) if !state.is_closed() && !state.is_synchronizing() => Ok(TcpHandle {
                id,
                local_port,
                remote: SockAddr::new(remote_addr, remote_port),
            }),
            Some((_, reset)) => {
                inner.remove(id);
                klog_debug!("tcp: connect to {}:{} failed", remote_addr, remote_port);
                Err(if reset {
                    TcpError::Refused
                } else {
                    TcpError::TimedOut
                })
            }
            None => Err(TcpError::TimedOut),
        }
    }

    /// Queue `data` for transmission.  Full segments go out as they fill;
    /// a partial one waits for [`tcp_push`](Self::tcp_push),
    /// [`tcp_shutdown`](Self::tcp_shutdown) or more data.  Blocks while the
    /// peer's window is closed.  Returns the number of bytes queued.
    pub async fn tcp_send(&self, handle: &TcpHandle, data: &[u8]) -> Result<usize, TcpError> {
        let mut rest = data;
        let mut sent = 0;
        while !rest.is_empty() {
            let mut inner = self.tcp.inner.lock().await;
            let conn = inner.conn(handle);
            if !conn.state.can_send() {
                return Err(TcpError::ConnectionDied);
            }
            let space = conn.send_mss.saturating_sub(conn.tail.len);
            if space == 0 {
                self.tcp_send_data(conn).await;
            } else {
                let window_end = conn.send_unack.wrapping_add(conn.send_window);
                let tail_end = conn.tail.seq.wrapping_add(conn.tail.len as u32);
                if !seq_gt(window_end, tail_end) {
                    if conn.tail.len > 0 && conn.send_unack == conn.transmitted {
                        // Nothing in flight will open the window for us.
                        self.tcp_send_data(conn).await;
                    } else {
                        klog_trace!(
                            "tcp: send blocked at {} for {}",
                            window_end.wrapping_sub(conn.send_init),
                            tail_end.wrapping_sub(conn.send_init)
                        );
                        drop(self.tcp.send.wait(inner).await);
                        continue;
                    }
                } else {
                    let room = window_end.wrapping_sub(tail_end) as usize;
                    let amount = space.min(rest.len()).min(room);
                    let at = IPV4_HEADER_LEN + TCP_HEADER_LEN + conn.tail.len;
                    conn.tail.buf.bytes_mut()[at..at + amount].copy_from_slice(&rest[..amount]);
                    conn.tail.len += amount;
                    conn.send_next = conn.send_next.wrapping_add(amount as u32);
                    rest = &rest[amount..];
                    sent += amount;
                }
            }
            drop(inner);
            if !rest.is_empty() {
                self.scheduler().yield_now().await;
            }
        }
        Ok(sent)
    }

    /// Send whatever partial segment is queued, with PSH.  With nothing
    /// queued an empty segment carries the PSH.  Deferred until the next
    /// ACK if data is in flight.
    pub async fn tcp_push(&self, handle: &TcpHandle) {
        let mut inner = self.tcp.inner.lock().await;
        let conn = inner.conn(handle);
        if !conn.state.can_send() {
            return;
        }
        conn.tail.flag.insert(TcpFlags::PSH);
        if conn.send_unack != conn.transmitted {
            conn.send_nagled = true;
        } else {
            self.tcp_send_data(conn).await;
        }
    }

    /// Send FIN after any queued data.  Ignored unless we are still allowed
    /// to send.
    pub async fn tcp_shutdown(&self, handle: &TcpHandle) {
        let mut inner = self.tcp.inner.lock().await;
        let conn = inner.conn(handle);
        let next = match conn.state {
            TcpState::Established => TcpState::FinWait1,
            TcpState::CloseWait => TcpState::LastAck,
            _ => return,
        };
        conn.send_next = conn.send_next.wrapping_add(1);
        conn.tail.flag.insert(TcpFlags::FIN);
        self.tcp_send_data(conn).await;
        conn.state = next;
    }

    /// Read received bytes into `out`.  Blocks until `out` is full, a
    /// pushed segment has been drained, or the peer has finished.  `Ok(0)`
    /// means end of stream.
    pub async fn tcp_recv(&self, handle: &TcpHandle, out: &mut [u8]) -> Result<usize, TcpError> {
        let limit = recv_limit(&self.config().tcp);
        let mss = TCP_MSS as u32;
        let mut inner = self.tcp.inner.lock().await;
        let mut received = 0;
        while received < out.len() {
            let conn = inner.conn(handle);
            if conn.buffered() == 0 {
                if conn.recv_pushed {
                    break;
                }
                if conn.state.peer_done() {
                    if conn.state.failed() {
                        return Err(TcpError::ConnectionDied);
                    }
                    break;
                }
                inner = self.tcp.recv.wait(inner).await;
                continue;
            }
            if let Some(ring) = conn.recv_buf.as_mut() {
                received += ring.read_into(&mut out[received..]);
            }
            let free = limit.saturating_sub(conn.buffered() as u32);
            if conn.recv_window < mss && free >= mss {
                // Reopen a window the peer may have stopped on.
                conn.recv_window = free;
                self.tcp_send_small(conn.endpoint(), conn.transmitted, TcpFlags::ACK)
                    .await;
            }
        }
        let conn = inner.conn(handle);
        if conn.buffered() == 0 {
            conn.recv_pushed = false;
        }
        Ok(received)
    }

    /// Kill the connection with RST.  Blocked sends and receives on it
    /// return `ConnectionDied`.  The handle must still be closed.
    pub async fn tcp_abort(&self, handle: &TcpHandle) {
        let mut inner = self.tcp.inner.lock().await;
        let conn = inner.conn(handle);
        self.tcp_abort_conn(conn).await;
    }

    /// Finish with a connection: send FIN if still open, wait for it to be
    /// acknowledged and release the handle.  A peer that has not sent its
    /// own FIN within the linger time is reset.
    pub async fn tcp_close(&self, handle: TcpHandle) {
        self.tcp_shutdown(&handle).await;
        let linger = self.config().tcp.fin_wait2_linger_us;
        let mut inner = self.tcp.inner.lock().await;
        while matches!(
            inner.conn(&handle).state,
            TcpState::FinWait1 | TcpState::Closing | TcpState::LastAck
        ) {
            inner = self.tcp.close.wait(inner).await;
        }
        let deadline = Some(self.now().saturating_add(linger));
        while inner.conn(&handle).state == TcpState::FinWait2 {
            let Some(budget) = wait_budget(self.now(), deadline) else {
                break;
            };
            inner = self.tcp.close.timed_wait(inner, budget).await.0;
        }

        let conn = inner.conn(&handle);
        let state = conn.state;
        match state {
            TcpState::SynReceived | TcpState::FinWait2 => {
                // The client will read no more, so anything else the peer
                // sends would be discarded.
                self.tcp_send_small(conn.endpoint(), conn.transmitted, TcpFlags::RST | TcpFlags::ACK)
                    .await;
                conn.state = TcpState::Closed { failed: true };
                inner.remove(handle.id);
            }
            TcpState::TimeWait { since } => {
                conn.state = TcpState::TimeWaitClosed { since };
            }
            TcpState::TimeWaitClosed { .. } => {}
            _ => inner.remove(handle.id),
        }
        klog_debug!("tcp: closed :{} -> {}", handle.local_port, handle.remote);
    }

    /// Current state of the connection.
    pub async fn tcp_state(&self, handle: &TcpHandle) -> TcpState {
        self.tcp.inner.lock().await.conn(handle).state
    }

    /// Connections not yet freed, whether or not a client holds them.
    pub async fn tcp_connections(&self) -> usize {
        self.tcp.inner.lock().await.live()
    }
}
