//! TCP data path: sequence arithmetic, header codec, retransmission,
//! reassembly and flow control.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::vec;
use std::vec::Vec;

use coopnet_lib::testing::TestResult;
use coopnet_lib::{assert_eq_test, assert_ok, assert_some, assert_test, pass};

use crate::net::loopback::LinkVerdict;
use crate::net::netdev::RxFrame;
use crate::net::tcp::{
    TCP_HEADER_LEN, TcpError, TcpFlags, TcpState, build_header, parse_header, parse_mss_option,
    seq_comp, seq_ge, seq_gt, seq_le, seq_lt, write_header, write_mss_option,
};
use crate::net::tcp_socket::RECV_BUF_SIZE;
use crate::net::types::EtherType;
use crate::net::{
    IPPROTO_TCP, IPV4_HEADER_LEN, Ipv4Addr, NetStack, ipv4_header_checksum, payload_checksum,
};
use crate::testbed::{IP_A, IP_B, MAC_A, Pair, new_sched, pair, pattern};

const PORT: u16 = 9000;
const SEGMENT: usize = 1460;

// =============================================================================
// Sequence numbers and headers
// =============================================================================

fn test_seq_comparison_wraps() -> TestResult {
    assert_test!(seq_comp(5, 0xFFFF_FFFE) > 0);
    assert_test!(seq_comp(0xFFFF_FFFE, 5) < 0);
    assert_eq_test!(seq_comp(42, 42), 0);
    assert_test!(seq_lt(0xFFFF_FFF0, 0x10));
    assert_test!(seq_le(7, 7));
    assert_test!(seq_gt(0x10, 0xFFFF_FFF0));
    assert_test!(seq_ge(0x10, 0x10));
    assert_test!(!seq_lt(100, 99));
    pass!()
}

fn test_header_write_then_parse() -> TestResult {
    let hdr = build_header(1234, 80, 0xDEAD_BEEF, 7, TcpFlags::SYN | TcpFlags::ACK, 8000, 6);
    let mut wire = [0xAAu8; 24];
    assert_eq_test!(write_header(&hdr, &mut wire), Some(24));
    assert_eq_test!(&wire[16..18], &[0u8, 0][..], "checksum left for the caller");
    assert_eq_test!(&wire[20..24], &[0u8; 4][..], "options area zeroed");
    assert_eq_test!(write_mss_option(1460, &mut wire[TCP_HEADER_LEN..]), Some(4));

    let parsed = assert_some!(parse_header(&wire));
    assert_eq_test!(parsed.src_port, 1234);
    assert_eq_test!(parsed.dst_port, 80);
    assert_eq_test!(parsed.seq_num, 0xDEAD_BEEF);
    assert_eq_test!(parsed.ack_num, 7);
    assert_eq_test!(parsed.flags, TcpFlags::SYN | TcpFlags::ACK);
    assert_eq_test!(parsed.window_size, 8000);
    assert_eq_test!(parsed.header_len(), 24);
    assert_eq_test!(parse_mss_option(&wire[TCP_HEADER_LEN..24]), Some(1460));
    pass!()
}

fn test_header_parse_rejects_bad_offsets() -> TestResult {
    let mut wire = [0u8; 20];
    wire[12] = 4 << 4;
    assert_test!(parse_header(&wire).is_none(), "offset below 5");
    wire[12] = 6 << 4;
    assert_test!(parse_header(&wire).is_none(), "options past the end");
    assert_test!(parse_header(&wire[..19]).is_none(), "short header");
    pass!()
}

fn test_mss_option_after_padding() -> TestResult {
    let options = [1u8, 1, 2, 4, 0x02, 0x18];
    assert_eq_test!(parse_mss_option(&options), Some(536));
    assert_eq_test!(parse_mss_option(&[0u8, 2, 4, 5, 0xb4]), None, "END stops the scan");
    assert_eq_test!(parse_mss_option(&[8u8, 10, 0, 0]), None, "truncated option");
    pass!()
}

fn test_state_predicates() -> TestResult {
    assert_test!(TcpState::Established.can_send());
    assert_test!(TcpState::CloseWait.can_send());
    assert_test!(!TcpState::FinWait1.can_send());
    assert_test!(TcpState::FinWait2.accepts_data());
    assert_test!(!TcpState::CloseWait.accepts_data());
    assert_test!(TcpState::TimeWait { since: 0 }.peer_done());
    assert_test!(TcpState::Closed { failed: true }.failed());
    assert_test!(!TcpState::Closed { failed: false }.failed());
    assert_test!(TcpState::SynReceived.is_synchronizing());
    assert_eq_test!(TcpState::FinWait2.name(), "FIN_WAIT_2");
    assert_eq_test!(TcpError::ConnectionDied.to_code(), -1);
    assert_eq_test!(TcpError::InvalidState.to_code(), -5);
    pass!()
}

// =============================================================================
// Transfers
// =============================================================================

/// Read until `total` bytes have arrived or the stream ends.
async fn read_all(
    stack: &crate::net::NetStack,
    conn: &crate::net::tcp_socket::TcpHandle,
    total: usize,
) -> Result<Vec<u8>, TcpError> {
    let mut data = vec![0u8; total];
    let mut got = 0;
    while got < total {
        let n = stack.tcp_recv(conn, &mut data[got..]).await?;
        if n == 0 {
            break;
        }
        got += n;
    }
    data.truncate(got);
    Ok(data)
}

fn test_lost_segment_is_retransmitted() -> TestResult {
    let sched = new_sched();
    let s = sched.clone();
    let result = sched.run(async move {
        let net = pair(&s);
        let data_frames: Rc<RefCell<Vec<(u32, Vec<u8>)>>> = Rc::new(RefCell::new(Vec::new()));
        let seen = data_frames.clone();
        net.link.set_filter(move |frame| match frame.tcp_segment() {
            Some((hdr, payload)) if frame.from == 0 && !payload.is_empty() => {
                let mut seen = seen.borrow_mut();
                seen.push((hdr.seq_num, payload.to_vec()));
                if seen.len() == 1 {
                    LinkVerdict::Drop
                } else {
                    LinkVerdict::Pass
                }
            }
            _ => LinkVerdict::Pass,
        });
        net.b.tcp_listen(PORT, Ipv4Addr::UNSPECIFIED, 0, 1).await;
        let client = assert_ok!(net.a.tcp_connect(0, IP_B, PORT, 5_000_000).await);
        let (server, _) = assert_ok!(net.b.tcp_accept(PORT, 1_000_000).await);

        let start = s.now();
        assert_ok!(net.a.tcp_send(&client, b"abcdef").await);
        net.a.tcp_push(&client).await;
        let mut buf = [0u8; 8];
        let n = assert_ok!(net.b.tcp_recv(&server, &mut buf).await);
        assert_eq_test!(&buf[..n], &b"abcdef"[..]);
        assert_test!(s.now() > start, "recovery needs the retransmit timer");

        let frames = data_frames.borrow().clone();
        assert_eq_test!(frames.len(), 2, "one loss, one retransmission");
        assert_eq_test!(&frames[1], &frames[0], "resent segment differs from the lost one");
        assert_eq_test!(&frames[0].1[..], &b"abcdef"[..]);

        net.a.tcp_abort(&client).await;
        net.a.tcp_close(client).await;
        net.b.tcp_close(server).await;
        pass!()
    });
    sched.shutdown();
    result
}

fn test_reordered_segments_are_reassembled() -> TestResult {
    let sched = new_sched();
    let s = sched.clone();
    let result = sched.run(async move {
        let net = pair(&s);
        let held = Rc::new(Cell::new(0u32));
        let data_frames = Rc::new(Cell::new(0u32));
        let (h, d) = (held.clone(), data_frames.clone());
        net.link.set_filter(move |frame| match frame.tcp_segment() {
            Some((_, payload)) if frame.from == 0 && !payload.is_empty() => {
                d.set(d.get() + 1);
                if h.get() < 3 {
                    h.set(h.get() + 1);
                    LinkVerdict::Hold
                } else {
                    LinkVerdict::Pass
                }
            }
            _ => LinkVerdict::Pass,
        });
        net.b.tcp_listen(PORT, Ipv4Addr::UNSPECIFIED, 0, 1).await;
        let client = assert_ok!(net.a.tcp_connect(0, IP_B, PORT, 5_000_000).await);
        let (server, _) = assert_ok!(net.b.tcp_accept(PORT, 1_000_000).await);

        // Three full segments go out at once; one byte stays queued.
        let sent = pattern(3 * SEGMENT + 1);
        assert_eq_test!(assert_ok!(net.a.tcp_send(&client, &sent).await), sent.len());
        assert_eq_test!(net.link.held(), 3);
        net.link.release_held(&[1, 2, 0]);
        net.a.tcp_push(&client).await;

        let got = assert_ok!(read_all(&net.b, &server, sent.len()).await);
        assert_eq_test!(got.len(), sent.len());
        assert_test!(got == sent, "reassembled stream differs");
        assert_eq_test!(data_frames.get(), 4, "nothing was retransmitted");

        net.a.tcp_abort(&client).await;
        net.a.tcp_close(client).await;
        net.b.tcp_close(server).await;
        pass!()
    });
    sched.shutdown();
    result
}

fn test_bulk_transfer_through_small_window() -> TestResult {
    let sched = new_sched();
    let s = sched.clone();
    let result = sched.run(async move {
        let net = pair(&s);
        net.b.tcp_listen(PORT, Ipv4Addr::UNSPECIFIED, 0, 1).await;
        let sent = pattern(5 * RECV_BUF_SIZE / 2);
        let received = Rc::new(RefCell::new(None));

        let server = net.b.clone();
        let sink = received.clone();
        let s2 = s.clone();
        let reader = s.spawn(async move {
            let Ok((conn, _)) = server.tcp_accept(PORT, 0).await else {
                return;
            };
            let mut data = Vec::new();
            let mut chunk = [0u8; 1000];
            loop {
                match server.tcp_recv(&conn, &mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => data.extend_from_slice(&chunk[..n]),
                }
                // A slow reader keeps the window closing.
                s2.sleep(10_000).await;
            }
            *sink.borrow_mut() = Some(data);
            server.tcp_close(conn).await;
        });

        let client = assert_ok!(net.a.tcp_connect(0, IP_B, PORT, 5_000_000).await);
        assert_eq_test!(assert_ok!(net.a.tcp_send(&client, &sent).await), sent.len());
        net.a.tcp_close(client).await;
        s.join(reader).await;

        let got = assert_some!(received.borrow_mut().take());
        assert_eq_test!(got.len(), sent.len());
        assert_test!(got == sent, "stream corrupted in transit");
        pass!()
    });
    sched.shutdown();
    result
}

/// Record the flags and payload length of every TCP segment `a` sends.
fn log_segments_from_a(net: &Pair) -> Rc<RefCell<Vec<(TcpFlags, usize)>>> {
    let log = Rc::new(RefCell::new(Vec::new()));
    let sink = log.clone();
    net.link.set_filter(move |frame| {
        if let Some((hdr, payload)) = frame.tcp_segment() {
            if frame.from == 0 {
                sink.borrow_mut().push((hdr.flags, payload.len()));
            }
        }
        LinkVerdict::Pass
    });
    log
}

fn test_push_without_data_sends_empty_segment() -> TestResult {
    let sched = new_sched();
    let s = sched.clone();
    let result = sched.run(async move {
        let net = pair(&s);
        net.b.tcp_listen(PORT, Ipv4Addr::UNSPECIFIED, 0, 1).await;
        let client = assert_ok!(net.a.tcp_connect(0, IP_B, PORT, 5_000_000).await);
        let (server, _) = assert_ok!(net.b.tcp_accept(PORT, 1_000_000).await);
        let sent = log_segments_from_a(&net);

        net.a.tcp_push(&client).await;
        assert_eq_test!(sent.borrow().clone(), vec![(TcpFlags::ACK | TcpFlags::PSH, 0)]);

        // Covers no sequence space: never retransmitted, never read as
        // end of stream.
        s.sleep(5_000_000).await;
        assert_eq_test!(sent.borrow().len(), 1);
        assert_eq_test!(net.b.tcp_state(&server).await, TcpState::Established);

        // Unpushed data waits in the tail.
        sent.borrow_mut().clear();
        assert_ok!(net.a.tcp_send(&client, b"zz").await);
        assert_eq_test!(sent.borrow().len(), 0);
        net.a.tcp_push(&client).await;
        assert_eq_test!(sent.borrow().clone(), vec![(TcpFlags::ACK | TcpFlags::PSH, 2)]);
        let got = assert_ok!(read_all(&net.b, &server, 2).await);
        assert_eq_test!(&got[..], &b"zz"[..]);

        net.a.tcp_abort(&client).await;
        net.a.tcp_close(client).await;
        net.b.tcp_close(server).await;
        pass!()
    });
    sched.shutdown();
    result
}

fn test_push_waits_for_data_in_flight() -> TestResult {
    let sched = new_sched();
    let s = sched.clone();
    let result = sched.run(async move {
        let net = pair(&s);
        net.b.tcp_listen(PORT, Ipv4Addr::UNSPECIFIED, 0, 1).await;
        let client = assert_ok!(net.a.tcp_connect(0, IP_B, PORT, 5_000_000).await);
        let (server, _) = assert_ok!(net.b.tcp_accept(PORT, 1_000_000).await);

        assert_ok!(net.a.tcp_send(&client, b"first").await);
        net.a.tcp_push(&client).await;
        let before = net.link.frames();
        assert_ok!(net.a.tcp_send(&client, b"second").await);
        net.a.tcp_push(&client).await;
        assert_eq_test!(net.link.frames(), before, "deferred until the ACK");

        let got = assert_ok!(read_all(&net.b, &server, 11).await);
        assert_eq_test!(&got[..], &b"firstsecond"[..]);

        net.a.tcp_abort(&client).await;
        net.a.tcp_close(client).await;
        net.b.tcp_close(server).await;
        pass!()
    });
    sched.shutdown();
    result
}

fn test_half_close_keeps_receiving() -> TestResult {
    let sched = new_sched();
    let s = sched.clone();
    let result = sched.run(async move {
        let net = pair(&s);
        net.b.tcp_listen(PORT, Ipv4Addr::UNSPECIFIED, 0, 1).await;
        let client = assert_ok!(net.a.tcp_connect(0, IP_B, PORT, 5_000_000).await);
        let (server, _) = assert_ok!(net.b.tcp_accept(PORT, 1_000_000).await);

        net.a.tcp_shutdown(&client).await;
        let mut buf = [0u8; 8];
        assert_eq_test!(assert_ok!(net.b.tcp_recv(&server, &mut buf).await), 0);
        assert_eq_test!(net.b.tcp_state(&server).await, TcpState::CloseWait);

        assert_ok!(net.b.tcp_send(&server, b"late").await);
        net.b.tcp_push(&server).await;
        let got = assert_ok!(read_all(&net.a, &client, 4).await);
        assert_eq_test!(&got[..], &b"late"[..]);
        assert_eq_test!(net.a.tcp_state(&client).await, TcpState::FinWait2);

        net.b.tcp_close(server).await;
        net.a.tcp_close(client).await;
        assert_eq_test!(net.b.tcp_connections().await, 0);
        pass!()
    });
    sched.shutdown();
    result
}

fn test_close_resets_peer_that_never_finishes() -> TestResult {
    let sched = new_sched();
    let s = sched.clone();
    let result = sched.run(async move {
        let net = pair(&s);
        net.b.tcp_listen(PORT, Ipv4Addr::UNSPECIFIED, 0, 1).await;
        let client = assert_ok!(net.a.tcp_connect(0, IP_B, PORT, 5_000_000).await);
        let (server, _) = assert_ok!(net.b.tcp_accept(PORT, 1_000_000).await);
        let sent = log_segments_from_a(&net);

        // b acknowledges a's FIN but never sends its own.
        let linger = net.a.config().tcp.fin_wait2_linger_us;
        let start = s.now();
        net.a.tcp_close(client).await;
        assert_test!(s.now() - start >= linger, "closed before the linger ran out");

        let log = sent.borrow().clone();
        assert_eq_test!(log.first().map(|&(flags, _)| flags), Some(TcpFlags::ACK | TcpFlags::FIN));
        assert_eq_test!(log.last().map(|&(flags, _)| flags), Some(TcpFlags::RST | TcpFlags::ACK));
        assert_eq_test!(net.a.tcp_connections().await, 0);

        s.sleep(10_000).await;
        let mut buf = [0u8; 4];
        assert_eq_test!(net.b.tcp_recv(&server, &mut buf).await, Err(TcpError::ConnectionDied));
        assert_eq_test!(net.b.tcp_send(&server, b"late").await, Err(TcpError::ConnectionDied));
        net.b.tcp_close(server).await;
        assert_eq_test!(net.b.tcp_connections().await, 0);
        pass!()
    });
    sched.shutdown();
    result
}

/// A segment from a's address to b's `PORT`, as b's device would hand it
/// over.
fn segment_for_b(stack: &NetStack, src_port: u16, seq: u32, ack: u32, flags: TcpFlags, options: &[u8]) -> RxFrame {
    let header_len = TCP_HEADER_LEN + options.len();
    let total = IPV4_HEADER_LEN + header_len;
    let hdr = build_header(src_port, PORT, seq, ack, flags, 8000, (header_len / 4) as u8);
    let mut buf = stack.pool().alloc();
    buf.init_ip(IPPROTO_TCP, IP_B);
    buf.set_ip_src(IP_A);
    {
        let b = buf.bytes_mut();
        b[2..4].copy_from_slice(&(total as u16).to_be_bytes());
        b[8] = 64;
        let segment = &mut b[IPV4_HEADER_LEN..total];
        let _ = write_header(&hdr, segment);
        segment[TCP_HEADER_LEN..].copy_from_slice(options);
        let sum = payload_checksum(IP_A, IP_B, IPPROTO_TCP, segment);
        segment[16..18].copy_from_slice(&sum.to_be_bytes());
        let sum = ipv4_header_checksum(&b[..IPV4_HEADER_LEN]);
        b[10..12].copy_from_slice(&sum.to_be_bytes());
    }
    buf.set_len(total.max(46));
    RxFrame {
        src: MAC_A,
        ethertype: EtherType::Ipv4.as_u16(),
        buf,
        broadcast: false,
        looped: false,
    }
}

fn test_segments_respect_peer_mss() -> TestResult {
    let sched = new_sched();
    let s = sched.clone();
    let result = sched.run(async move {
        let net = pair(&s);
        // Nothing reaches a; the peer here is hand-built.
        let from_b: Rc<RefCell<Vec<(TcpFlags, u32, usize)>>> = Rc::new(RefCell::new(Vec::new()));
        let sink = from_b.clone();
        net.link.set_filter(move |frame| {
            if let Some((hdr, payload)) = frame.tcp_segment() {
                if frame.from == 1 {
                    sink.borrow_mut().push((hdr.flags, hdr.seq_num, payload.len()));
                }
            }
            LinkVerdict::Drop
        });
        net.b.tcp_listen(PORT, Ipv4Addr::UNSPECIFIED, 0, 1).await;

        let mut mss = [0u8; 4];
        assert_some!(write_mss_option(100, &mut mss));
        net.b.rx_queue().deliver(segment_for_b(&net.b, 4000, 1000, 0, TcpFlags::SYN, &mss));
        s.sleep(10_000).await;
        let syn_ack = from_b.borrow().first().copied();
        let (flags, iss, _) = assert_some!(syn_ack);
        assert_eq_test!(flags, TcpFlags::SYN | TcpFlags::ACK);

        let ack = iss.wrapping_add(1);
        net.b.rx_queue().deliver(segment_for_b(&net.b, 4000, 1001, ack, TcpFlags::ACK, &[]));
        let (server, remote) = assert_ok!(net.b.tcp_accept(PORT, 1_000_000).await);
        assert_eq_test!(remote.port, 4000);

        from_b.borrow_mut().clear();
        assert_eq_test!(assert_ok!(net.b.tcp_send(&server, &pattern(250)).await), 250);
        let sizes: Vec<usize> = from_b.borrow().iter().map(|&(_, _, len)| len).collect();
        assert_eq_test!(sizes, vec![100, 100], "full segments sized to the peer's MSS");

        net.b.tcp_abort(&server).await;
        net.b.tcp_close(server).await;
        pass!()
    });
    sched.shutdown();
    result
}

coopnet_lib::define_test_suite!(
    tcp_data,
    [
        test_seq_comparison_wraps,
        test_header_write_then_parse,
        test_header_parse_rejects_bad_offsets,
        test_mss_option_after_padding,
        test_state_predicates,
        test_lost_segment_is_retransmitted,
        test_reordered_segments_are_reassembled,
        test_bulk_transfer_through_small_window,
        test_push_without_data_sends_empty_segment,
        test_push_waits_for_data_in_flight,
        test_half_close_keeps_receiving,
        test_close_resets_peer_that_never_finishes,
        test_segments_respect_peer_mss,
    ]
);
