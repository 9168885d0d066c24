//! Software devices: the loopback interface, the two-ended link, and the
//! stack's own 127/8 path.

use std::rc::Rc;

use coopnet_lib::testing::TestResult;
use coopnet_lib::{assert_eq_test, assert_ok, assert_test, pass};

use crate::net::loopback::{Link, LinkVerdict, LoopbackDev};
use crate::net::netdev::{NetDevice, RxQueue};
use crate::net::udp::UdpPortHandler;
use crate::net::{Ipv4Addr, MacAddr, NetError, PacketPool, SockAddr};
use crate::testbed::{IP_A, MAC_A, MAC_B, looped, new_sched, send_udp};

const IPV4: u16 = 0x0800;

fn test_loopback_reflects_frames() -> TestResult {
    let sched = new_sched();
    let dev = LoopbackDev::new(MAC_A);
    assert_eq_test!(dev.transmit(MAC_A, IPV4, &[1, 2, 3]), Err(NetError::LinkDown));
    assert_eq_test!(dev.stats().tx_dropped, 1);

    let rx = RxQueue::new(&sched, PacketPool::new());
    dev.attach(rx.clone());
    assert_eq_test!(dev.transmit(MacAddr::BROADCAST, IPV4, &[1, 2, 3]), Ok(()));
    assert_eq_test!(rx.pending(), 1);
    let stats = dev.stats();
    assert_eq_test!(stats.tx_packets, 1);
    assert_eq_test!(stats.rx_packets, 1);
    assert_eq_test!(stats.tx_bytes, 3);

    let frame = sched.run(async move { rx.next().await });
    assert_eq_test!(frame.src, MAC_A);
    assert_eq_test!(frame.ethertype, IPV4);
    assert_eq_test!(frame.buf.data(), &[1u8, 2, 3][..]);
    assert_test!(frame.broadcast);
    assert_test!(!frame.looped);
    sched.shutdown();
    pass!()
}

fn test_link_delivers_by_address() -> TestResult {
    let sched = new_sched();
    let (link, end_a, end_b) = Link::new(MAC_A, MAC_B);
    let rx_b = RxQueue::new(&sched, PacketPool::new());
    end_b.attach(rx_b.clone());

    assert_eq_test!(end_a.transmit(MAC_B, IPV4, &[7]), Ok(()));
    assert_eq_test!(rx_b.pending(), 1);
    assert_eq_test!(end_a.transmit(MacAddr([0x02, 9, 9, 9, 9, 9]), IPV4, &[8]), Ok(()));
    assert_eq_test!(rx_b.pending(), 1, "not addressed to b");
    assert_eq_test!(end_b.stats().rx_dropped, 1);

    // Nobody attached at a's end.
    assert_eq_test!(end_b.transmit(MAC_A, IPV4, &[9]), Ok(()));
    assert_eq_test!(end_a.stats().rx_dropped, 1);
    assert_eq_test!(link.frames(), 3);
    pass!()
}

fn test_link_filter_holds_and_reorders() -> TestResult {
    let sched = new_sched();
    let (link, end_a, end_b) = Link::new(MAC_A, MAC_B);
    let rx_b = RxQueue::new(&sched, PacketPool::new());
    end_b.attach(rx_b.clone());
    link.set_filter(|frame| match frame.payload.first() {
        Some(0) => LinkVerdict::Drop,
        _ => LinkVerdict::Hold,
    });

    for first in 0u8..4 {
        assert_eq_test!(end_a.transmit(MAC_B, IPV4, &[first]), Ok(()));
    }
    assert_eq_test!(link.held(), 3);
    assert_eq_test!(rx_b.pending(), 0);

    link.release_held(&[2, 0]);
    assert_eq_test!(link.held(), 0, "unnamed frames are discarded");
    let order = sched.run(async move {
        let first = rx_b.next().await.buf.data()[0];
        let second = rx_b.next().await.buf.data()[0];
        (first, second)
    });
    assert_eq_test!(order, (3, 1));

    link.clear_filter();
    assert_eq_test!(end_a.transmit(MAC_B, IPV4, &[5]), Ok(()));
    assert_eq_test!(link.held(), 0);
    sched.shutdown();
    pass!()
}

fn test_stack_talks_to_itself() -> TestResult {
    let sched = new_sched();
    let s = sched.clone();
    let result = sched.run(async move {
        let stack = looped(&s);
        stack.udp_register(7000, UdpPortHandler::Enqueue);
        assert_ok!(send_udp(&stack, IP_A, 7000, 6000, b"me").await);
        let dgram = assert_ok!(stack.udp_recv(7000, 1_000_000).await);
        assert_eq_test!(dgram.payload(), &b"me"[..]);
        assert_eq_test!(dgram.src(), SockAddr::new(IP_A, 6000));
        assert_eq_test!(stack.arp_lookup(IP_A).await, Some(MAC_A));
        pass!()
    });
    sched.shutdown();
    result
}

fn test_localhost_bypasses_device() -> TestResult {
    let sched = new_sched();
    let s = sched.clone();
    let result = sched.run(async move {
        let stack = looped(&s);
        stack.udp_register(7001, UdpPortHandler::Enqueue);
        let before = stack.device_stats();
        assert_ok!(send_udp(&stack, Ipv4Addr::LOCALHOST, 7001, 6001, b"local").await);
        let dgram = assert_ok!(stack.udp_recv(7001, 1_000_000).await);
        assert_eq_test!(dgram.payload(), &b"local"[..]);
        assert_eq_test!(dgram.src(), SockAddr::new(Ipv4Addr::LOCALHOST, 6001));
        assert_eq_test!(stack.device_stats(), before, "device untouched");
        pass!()
    });
    sched.shutdown();
    result
}

fn test_pool_is_shared_with_rx_queue() -> TestResult {
    let sched = new_sched();
    let pool = PacketPool::new();
    let rx = RxQueue::new(&sched, pool.clone());
    let buf = rx.alloc();
    assert_test!(Rc::ptr_eq(buf.pool(), &pool));
    pass!()
}

coopnet_lib::define_test_suite!(
    loopback,
    [
        test_loopback_reflects_frames,
        test_link_delivers_by_address,
        test_link_filter_holds_and_reorders,
        test_stack_talks_to_itself,
        test_localhost_bypasses_device,
        test_pool_is_shared_with_rx_queue,
    ]
);
