//! Fixtures for the stack tests: stacks on a virtual clock, joined by a
//! software link or looped back on themselves.
//!
//! Every scheduler here runs on a [`ManualClock`] with a limit, so timeouts
//! cost nothing and a hang fails the test instead of stalling it.

use std::boxed::Box;
use std::rc::Rc;
use std::vec::Vec;

use coopnet_core::Scheduler;
use coopnet_lib::ManualClock;

use crate::net::loopback::{Link, LoopbackDev};
use crate::net::udp::UdpDatagram;
use crate::net::{Ipv4Addr, MacAddr, NetConfig, NetStack, PacketBuf};

pub(crate) const MAC_A: MacAddr = MacAddr([0x02, 0, 0, 0, 0, 0x0a]);
pub(crate) const MAC_B: MacAddr = MacAddr([0x02, 0, 0, 0, 0, 0x0b]);
pub(crate) const IP_A: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
pub(crate) const IP_B: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);
pub(crate) const MASK: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 0);

pub(crate) fn new_sched() -> Scheduler {
    let clock = Rc::new(ManualClock::default().with_limit_micros(600_000_000));
    Scheduler::new(clock)
}

/// Two stacks on one cable.
pub(crate) struct Pair {
    pub link: Link,
    pub a: Rc<NetStack>,
    pub b: Rc<NetStack>,
}

pub(crate) fn pair_with(sched: &Scheduler, cfg_a: NetConfig, cfg_b: NetConfig) -> Pair {
    let (link, end_a, end_b) = Link::new(MAC_A, MAC_B);
    let a = NetStack::new(sched, Box::new(end_a), cfg_a);
    let b = NetStack::new(sched, Box::new(end_b), cfg_b);
    Pair { link, a, b }
}

/// `a` is 10.0.0.1 and `b` is 10.0.0.2 on a /24.
pub(crate) fn pair(sched: &Scheduler) -> Pair {
    pair_with(
        sched,
        NetConfig::with_address(IP_A, MASK),
        NetConfig::with_address(IP_B, MASK),
    )
}

/// A stack talking to itself at 10.0.0.1.
pub(crate) fn looped(sched: &Scheduler) -> Rc<NetStack> {
    NetStack::new(
        sched,
        Box::new(LoopbackDev::new(MAC_A)),
        NetConfig::with_address(IP_A, MASK),
    )
}

/// Send `payload` as one UDP datagram.
pub(crate) async fn send_udp(
    stack: &NetStack,
    dest: Ipv4Addr,
    dest_port: u16,
    src_port: u16,
    payload: &[u8],
) -> Result<(), crate::net::NetError> {
    let mut buf: PacketBuf = stack.pool().alloc();
    buf.udp_payload_mut()[..payload.len()].copy_from_slice(payload);
    stack
        .udp_send(&mut buf, dest, dest_port, src_port, payload.len())
        .await
}

/// Reply to `request` from `port` with `payload`.
pub(crate) async fn reply_udp(stack: &NetStack, port: u16, request: &UdpDatagram, payload: &[u8]) {
    let src = request.src();
    let _ = send_udp(stack, src.ip, src.port, port, payload).await;
}

pub(crate) fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 + 3) as u8).collect()
}
