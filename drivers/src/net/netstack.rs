//! The stack instance: one interface, its configuration, and the state of
//! every protocol layer.
//!
//! # Architecture
//!
//! A [`NetStack`] owns a [`NetDevice`] and the [`RxQueue`] the device
//! delivers into.  [`NetStack::new`] registers the ICMP, UDP and TCP
//! receivers with the IP layer and starts two service threads on the
//! scheduler:
//!
//! - the deliver thread, which takes frames off the receive queue and runs
//!   the Ethernet, IP and transport up-calls for each in turn;
//! - the TCP retransmitter.
//!
//! Both hold an `Rc` of the stack, so a stack lives until its scheduler is
//! shut down.
//!
//! # Integration
//!
//! - **DHCP**: [`NetStack::dhcp_configure`] installs the lease through
//!   [`NetStack::set_config`].
//! - **ARP / IP**: read [`NetStack::config`] for our address, mask and router.
//! - **TCP / UDP / DNS**: draw sequence numbers, ports and ids from
//!   [`NetStack::random_u32`].

use alloc::boxed::Box;
use alloc::rc::Rc;
use core::fmt;

use coopnet_core::Scheduler;
use coopnet_lib::{klog_debug, klog_info};

use super::arp::ArpCache;
use super::config::NetConfig;
use super::icmp::{IcmpLayer, icmp_receive};
use super::ipv4::IpLayer;
use super::netdev::{NetDevice, NetDeviceStats, RxQueue};
use super::pool::PacketPool;
use super::tcp_socket::{TcpLayer, tcp_receive};
use super::types::MacAddr;
use super::udp::{UdpLayer, udp_receive};
use super::{IPPROTO_ICMP, IPPROTO_TCP, IPPROTO_UDP};
use crate::random::Lfsr64;

pub struct NetStack {
    sched: Scheduler,
    pool: Rc<PacketPool>,
    device: Box<dyn NetDevice>,
    rx: Rc<RxQueue>,
    mac: MacAddr,
    config: spin::Mutex<NetConfig>,
    rng: spin::Mutex<Lfsr64>,
    pub(crate) arp: ArpCache,
    pub(crate) ip: IpLayer,
    pub(crate) icmp: IcmpLayer,
    pub(crate) udp: UdpLayer,
    pub(crate) tcp: TcpLayer,
}

impl NetStack {
    /// Bring up a stack on `device` and start its service threads.
    pub fn new(sched: &Scheduler, device: Box<dyn NetDevice>, config: NetConfig) -> Rc<Self> {
        let pool = PacketPool::new();
        let rx = RxQueue::new(sched, pool.clone());
        device.attach(rx.clone());
        let mac = config.mac.unwrap_or_else(|| device.mac());

        // Mix the MAC into the seed so stacks sharing a clock differ.
        let mac_bits = mac
            .as_bytes()
            .iter()
            .fold(0u64, |acc, &b| (acc << 8) | b as u64);
        let rng = Lfsr64::with_seed(sched.now() ^ mac_bits);

        let stack = Rc::new(Self {
            sched: sched.clone(),
            pool,
            device,
            rx,
            mac,
            config: spin::Mutex::new(config),
            rng: spin::Mutex::new(rng),
            arp: ArpCache::new(sched),
            ip: IpLayer::new(),
            icmp: IcmpLayer::new(),
            udp: UdpLayer::new(sched),
            tcp: TcpLayer::new(sched),
        });

        stack.ip_register(IPPROTO_ICMP, Some(icmp_receive));
        stack.ip_register(IPPROTO_UDP, Some(udp_receive));
        stack.ip_register(IPPROTO_TCP, Some(tcp_receive));

        let deliver = stack.clone();
        sched.spawn(async move {
            loop {
                let frame = deliver.rx.next().await;
                deliver.enet_dispatch(frame).await;
            }
        });
        let retransmit = stack.clone();
        sched.spawn(async move {
            retransmit.tcp_retransmitter().await;
        });

        klog_info!("net: up on {} as {}", mac, config.ip);
        stack
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.sched
    }

    pub fn device(&self) -> &dyn NetDevice {
        &*self.device
    }

    pub fn device_stats(&self) -> NetDeviceStats {
        self.device.stats()
    }

    pub fn mac(&self) -> MacAddr {
        self.mac
    }

    pub fn pool(&self) -> &Rc<PacketPool> {
        &self.pool
    }

    pub fn rx_queue(&self) -> &Rc<RxQueue> {
        &self.rx
    }

    /// A copy of the current configuration.
    pub fn config(&self) -> NetConfig {
        *self.config.lock()
    }

    /// Replace the whole configuration.  The MAC override only matters at
    /// creation and is ignored here.
    pub fn set_config(&self, config: NetConfig) {
        klog_debug!(
            "net: configured {} mask {} router {}",
            config.ip,
            config.mask,
            config.router
        );
        *self.config.lock() = config;
    }

    /// Static alternative to DHCP: take addresses, router and DNS servers
    /// from `cfg`, keeping the current tunables.
    pub fn configure_static(&self, cfg: &NetConfig) {
        let mut next = self.config();
        next.ip = cfg.ip;
        next.mask = cfg.mask;
        next.router = cfg.router;
        next.dns = cfg.dns;
        self.set_config(next);
    }

    /// Microseconds on the scheduler's clock.
    pub fn now(&self) -> u64 {
        self.sched.now()
    }

    pub fn random_u32(&self) -> u32 {
        self.rng.lock().next_u32()
    }

    pub fn random_u16(&self) -> u16 {
        self.rng.lock().next_u16()
    }
}

impl fmt::Debug for NetStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cfg = self.config();
        f.debug_struct("NetStack")
            .field("mac", &self.mac)
            .field("ip", &cfg.ip)
            .field("mask", &cfg.mask)
            .field("router", &cfg.router)
            .field("rx_pending", &self.rx.pending())
            .finish()
    }
}
