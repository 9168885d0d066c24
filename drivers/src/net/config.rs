//! Stack configuration: addresses plus protocol tunables.
//!
//! Everything has a working default; [`NetConfig::from_cmdline`] overrides
//! fields from a boot-style `key=value` line.

use coopnet_lib::cmdline;
use coopnet_lib::klog::{KlogLevel, klog_set_level};
use coopnet_lib::klog_warn;

use super::types::{Ipv4Addr, MacAddr};

/// Number of DNS servers remembered.
pub const MAX_DNS_SERVERS: usize = 4;

const SECOND_US: u64 = 1_000_000;

/// TCP tunables.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TcpTuning {
    /// Receive buffer size, and so the largest window we advertise.
    pub max_recv_window: u32,
    /// How often the retransmitter wakes.
    pub retransmit_interval_us: u64,
    /// A segment unacknowledged for this long kills the connection.
    pub abort_after_us: u64,
    /// How long a closed connection lingers in TIME_WAIT before the
    /// retransmitter frees it.
    pub time_wait_us: u64,
    /// How long `tcp_close` waits in FIN_WAIT_2 for the peer's FIN before
    /// resetting.
    pub fin_wait2_linger_us: u64,
}

impl Default for TcpTuning {
    fn default() -> Self {
        Self {
            max_recv_window: 8000,
            retransmit_interval_us: 2 * SECOND_US,
            abort_after_us: 20 * SECOND_US,
            time_wait_us: 60 * SECOND_US,
            fin_wait2_linger_us: 5 * SECOND_US,
        }
    }
}

/// ARP cache tunables.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ArpTuning {
    /// Age at which a cache entry is no longer trusted.
    pub lifetime_us: u64,
    /// Requests sent by one lookup before giving up.
    pub attempts: u32,
    /// Wait for a reply after each request.
    pub wait_us: u64,
}

impl Default for ArpTuning {
    fn default() -> Self {
        Self {
            lifetime_us: 60 * SECOND_US,
            attempts: 5,
            wait_us: 50_000,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NetConfig {
    /// Our address; unspecified until DHCP or static configuration.
    pub ip: Ipv4Addr,
    pub mask: Ipv4Addr,
    pub router: Ipv4Addr,
    pub dns: [Ipv4Addr; MAX_DNS_SERVERS],
    /// Overrides the device's MAC address when set.
    pub mac: Option<MacAddr>,
    pub tcp: TcpTuning,
    pub arp: ArpTuning,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            ip: Ipv4Addr::UNSPECIFIED,
            mask: Ipv4Addr::UNSPECIFIED,
            router: Ipv4Addr::UNSPECIFIED,
            dns: [Ipv4Addr::UNSPECIFIED; MAX_DNS_SERVERS],
            mac: None,
            tcp: TcpTuning::default(),
            arp: ArpTuning::default(),
        }
    }
}

impl NetConfig {
    /// A static configuration on a subnet, without router or DNS.
    pub fn with_address(ip: Ipv4Addr, mask: Ipv4Addr) -> Self {
        Self {
            ip,
            mask,
            ..Self::default()
        }
    }

    pub fn dns_servers(&self) -> impl Iterator<Item = Ipv4Addr> + '_ {
        self.dns.iter().copied().filter(|a| !a.is_unspecified())
    }

    /// Parse a configuration line such as
    /// `net.ip=10.0.0.2 net.mask=255.255.255.0 net.dns=10.0.0.1,10.0.0.9 klog=debug`.
    ///
    /// Unknown keys are ignored; malformed values keep their default and log
    /// a warning.  `klog=` takes effect immediately.
    pub fn from_cmdline(line: &str) -> Self {
        let mut cfg = Self::default();
        for (key, value) in cmdline::pairs(line) {
            let ok = match key {
                "net.ip" => parse_addr(value, &mut cfg.ip),
                "net.mask" => parse_addr(value, &mut cfg.mask),
                "net.router" => parse_addr(value, &mut cfg.router),
                "net.dns" => parse_dns(value, &mut cfg.dns),
                "net.mac" => MacAddr::parse(value).map(|mac| cfg.mac = Some(mac)).is_some(),
                "tcp.window" => match cmdline::parse_u32(value) {
                    Some(w) if w > 0 => {
                        cfg.tcp.max_recv_window = w;
                        true
                    }
                    _ => false,
                },
                "tcp.rto_ms" => parse_ms(value, &mut cfg.tcp.retransmit_interval_us),
                "arp.lifetime_ms" => parse_ms(value, &mut cfg.arp.lifetime_us),
                "klog" => KlogLevel::from_name(value).map(klog_set_level).is_some(),
                _ => true,
            };
            if !ok {
                klog_warn!("config: ignoring malformed {}={}", key, value);
            }
        }
        cfg
    }
}

fn parse_addr(value: &str, out: &mut Ipv4Addr) -> bool {
    match Ipv4Addr::parse(value) {
        Some(addr) => {
            *out = addr;
            true
        }
        None => false,
    }
}

fn parse_dns(value: &str, out: &mut [Ipv4Addr; MAX_DNS_SERVERS]) -> bool {
    let mut servers = [Ipv4Addr::UNSPECIFIED; MAX_DNS_SERVERS];
    for (slot, text) in servers.iter_mut().zip(value.split(',')) {
        match Ipv4Addr::parse(text) {
            Some(addr) => *slot = addr,
            None => return false,
        }
    }
    *out = servers;
    true
}

fn parse_ms(value: &str, out: &mut u64) -> bool {
    match cmdline::parse_u32(value) {
        Some(ms) if ms > 0 => {
            *out = ms as u64 * 1000;
            true
        }
        _ => false,
    }
}
