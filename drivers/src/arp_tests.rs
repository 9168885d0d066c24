//! ARP resolution and the direct-mapped cache.

use coopnet_lib::testing::TestResult;
use coopnet_lib::{assert_eq_test, assert_some, assert_test, pass};

use crate::net::arp::{ARP_CACHE_SIZE, ArpPacket};
use crate::net::{
    ARP_HEADER_LEN, ARP_OPER_REPLY, ARP_OPER_REQUEST, Ipv4Addr, MacAddr, NetConfig,
};
use crate::testbed::{IP_A, IP_B, MAC_A, MAC_B, MASK, new_sched, pair, pair_with};

fn test_packet_write_then_parse() -> TestResult {
    let packet = ArpPacket {
        oper: ARP_OPER_REPLY,
        sender_mac: MAC_A,
        sender_ip: IP_A,
        target_mac: MAC_B,
        target_ip: IP_B,
    };
    let mut wire = [0u8; 64];
    assert_eq_test!(packet.write(&mut wire), ARP_HEADER_LEN);
    assert_eq_test!(&wire[0..8], &[0u8, 1, 0x08, 0x00, 6, 4, 0, 2][..]);
    assert_eq_test!(&wire[14..18], &[10u8, 0, 0, 1][..]);
    assert_eq_test!(ArpPacket::parse(&wire[..ARP_HEADER_LEN]), Some(packet));
    pass!()
}

fn test_parse_rejects_foreign_formats() -> TestResult {
    let packet = ArpPacket {
        oper: ARP_OPER_REQUEST,
        sender_mac: MAC_A,
        sender_ip: IP_A,
        target_mac: MacAddr::ZERO,
        target_ip: IP_B,
    };
    let mut wire = [0u8; ARP_HEADER_LEN];
    packet.write(&mut wire);
    assert_test!(ArpPacket::parse(&wire[..ARP_HEADER_LEN - 1]).is_none(), "short");

    let mut other = wire;
    other[1] = 6;
    assert_test!(ArpPacket::parse(&other).is_none(), "hardware type");
    let mut other = wire;
    other[5] = 16;
    assert_test!(ArpPacket::parse(&other).is_none(), "protocol length");
    pass!()
}

fn test_resolves_peer_and_teaches_it_our_address() -> TestResult {
    let sched = new_sched();
    let s = sched.clone();
    let result = sched.run(async move {
        let net = pair(&s);
        assert_eq_test!(net.a.arp_get_mac(IP_B).await, Some(MAC_B));
        assert_eq_test!(net.link.frames(), 2, "one request, one reply");
        assert_eq_test!(net.b.arp_lookup(IP_A).await, Some(MAC_A));

        // Cached now: no more traffic.
        assert_eq_test!(net.a.arp_get_mac(IP_B).await, Some(MAC_B));
        assert_eq_test!(net.link.frames(), 2);
        pass!()
    });
    sched.shutdown();
    result
}

fn test_unanswered_lookup_gives_up() -> TestResult {
    let sched = new_sched();
    let s = sched.clone();
    let result = sched.run(async move {
        let net = pair(&s);
        let tuning = net.a.config().arp;
        let start = s.now();
        assert_eq_test!(net.a.arp_get_mac(Ipv4Addr::new(10, 0, 0, 99)).await, None);
        assert_eq_test!(net.link.frames(), tuning.attempts as u64, "one request per attempt");
        assert_test!(s.now() - start >= tuning.attempts as u64 * tuning.wait_us);
        pass!()
    });
    sched.shutdown();
    result
}

fn test_broadcast_needs_no_resolution() -> TestResult {
    let sched = new_sched();
    let s = sched.clone();
    let result = sched.run(async move {
        let net = pair(&s);
        assert_eq_test!(net.a.arp_get_mac(Ipv4Addr::BROADCAST).await, Some(MacAddr::BROADCAST));
        assert_eq_test!(net.link.frames(), 0);
        pass!()
    });
    sched.shutdown();
    result
}

fn test_insert_lookup_remove() -> TestResult {
    let sched = new_sched();
    let s = sched.clone();
    let result = sched.run(async move {
        let net = pair(&s);
        let peer = Ipv4Addr::new(10, 0, 0, 50);
        let mac = MacAddr([0x02, 1, 2, 3, 4, 5]);
        assert_eq_test!(net.a.arp_lookup(peer).await, None);
        net.a.arp_insert(peer, mac).await;
        assert_eq_test!(net.a.arp_lookup(peer).await, Some(mac));
        net.a.arp_remove(peer).await;
        assert_eq_test!(net.a.arp_lookup(peer).await, None);

        net.a.arp_insert(Ipv4Addr::UNSPECIFIED, mac).await;
        assert_eq_test!(net.a.arp_lookup(Ipv4Addr::UNSPECIFIED).await, None);
        pass!()
    });
    sched.shutdown();
    result
}

fn test_colliding_addresses_share_a_slot() -> TestResult {
    let sched = new_sched();
    let s = sched.clone();
    let result = sched.run(async move {
        let net = pair(&s);
        let first = Ipv4Addr::new(10, 0, 0, 1);
        let second = Ipv4Addr::from_u32(first.to_u32() + ARP_CACHE_SIZE as u32);
        net.a.arp_insert(first, MAC_B).await;
        net.a.arp_insert(second, MAC_A).await;
        assert_eq_test!(net.a.arp_lookup(second).await, Some(MAC_A));
        assert_eq_test!(net.a.arp_lookup(first).await, None, "evicted by the collision");
        pass!()
    });
    sched.shutdown();
    result
}

fn test_off_subnet_addresses_use_router() -> TestResult {
    let sched = new_sched();
    let s = sched.clone();
    let result = sched.run(async move {
        let router = Ipv4Addr::new(10, 0, 0, 254);
        let mut cfg = NetConfig::with_address(IP_A, MASK);
        cfg.router = router;
        let net = pair_with(&s, cfg, NetConfig::with_address(IP_B, MASK));
        let router_mac = MacAddr([0x02, 0, 0, 0, 0, 0xfe]);
        net.a.arp_insert(router, router_mac).await;
        assert_eq_test!(net.a.arp_lookup(Ipv4Addr::new(8, 8, 8, 8)).await, Some(router_mac));
        assert_eq_test!(net.a.arp_get_mac(Ipv4Addr::new(192, 168, 1, 1)).await, Some(router_mac));
        assert_eq_test!(net.link.frames(), 0);
        pass!()
    });
    sched.shutdown();
    result
}

fn test_entries_expire() -> TestResult {
    let sched = new_sched();
    let s = sched.clone();
    let result = sched.run(async move {
        let mut cfg = NetConfig::with_address(IP_A, MASK);
        cfg.arp.lifetime_us = 1_000_000;
        let net = pair_with(&s, cfg, NetConfig::with_address(IP_B, MASK));
        let peer = Ipv4Addr::new(10, 0, 0, 60);
        net.a.arp_insert(peer, MAC_B).await;
        s.sleep(999_000).await;
        assert_some!(net.a.arp_lookup(peer).await, "still fresh");
        s.sleep(2_000).await;
        assert_eq_test!(net.a.arp_lookup(peer).await, None);

        // A stale peer is asked again.
        assert_eq_test!(net.a.arp_get_mac(IP_B).await, Some(MAC_B));
        s.sleep(1_000_001).await;
        let before = net.link.frames();
        assert_eq_test!(net.a.arp_get_mac(IP_B).await, Some(MAC_B));
        assert_eq_test!(net.link.frames(), before + 2);
        pass!()
    });
    sched.shutdown();
    result
}

coopnet_lib::define_test_suite!(
    arp,
    [
        test_packet_write_then_parse,
        test_parse_rejects_foreign_formats,
        test_resolves_peer_and_teaches_it_our_address,
        test_unanswered_lookup_gives_up,
        test_broadcast_needs_no_resolution,
        test_insert_lookup_remove,
        test_colliding_addresses_share_a_slot,
        test_off_subnet_addresses_use_router,
        test_entries_expire,
    ]
);
