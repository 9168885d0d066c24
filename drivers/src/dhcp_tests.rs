//! DHCP: message layout, option parsing, and a full lease from a scripted
//! server.

use std::cell::RefCell;
use std::rc::Rc;
use std::vec::Vec;

use coopnet_lib::testing::TestResult;
use coopnet_lib::{assert_eq_test, assert_some, assert_test, pass};

use crate::net::dhcp::{
    BOOTP_HEADER_LEN, DhcpOptions, DhcpReply, MSG_ACK, MSG_DISCOVER, MSG_NAK, MSG_OFFER,
    MSG_REQUEST, UDP_PORT_CLIENT, UDP_PORT_SERVER, build_discover, build_request,
    parse_bootp_reply, read_dhcp_options,
};
use crate::net::udp::UdpPortHandler;
use crate::net::{Ipv4Addr, NetConfig, NetStack};
use crate::testbed::{IP_A, IP_B, MAC_A, MASK, new_sched, pair_with, send_udp};

const ROUTER: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 254);
const DNS_1: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 53);
const DNS_2: Ipv4Addr = Ipv4Addr::new(9, 9, 9, 9);

/// A server reply to `xid` of message type `kind`, offering [`IP_A`].
fn server_reply(xid: u32, kind: u8) -> Vec<u8> {
    let mut msg = std::vec![0u8; BOOTP_HEADER_LEN];
    msg[0] = 2;
    msg[1] = 1;
    msg[2] = 6;
    msg[4..8].copy_from_slice(&xid.to_be_bytes());
    msg[16..20].copy_from_slice(IP_A.as_bytes());
    msg[28..34].copy_from_slice(MAC_A.as_bytes());
    msg[236..240].copy_from_slice(&[0x63, 0x82, 0x53, 0x63]);
    msg.extend_from_slice(&[53, 1, kind]);
    msg.extend_from_slice(&[54, 4]);
    msg.extend_from_slice(IP_B.as_bytes());
    msg.extend_from_slice(&[1, 4]);
    msg.extend_from_slice(MASK.as_bytes());
    msg.extend_from_slice(&[3, 4]);
    msg.extend_from_slice(ROUTER.as_bytes());
    msg.extend_from_slice(&[6, 8]);
    msg.extend_from_slice(DNS_1.as_bytes());
    msg.extend_from_slice(DNS_2.as_bytes());
    msg.push(255);
    msg
}

fn xid_of(msg: &[u8]) -> u32 {
    u32::from_be_bytes([msg[4], msg[5], msg[6], msg[7]])
}

/// Run a server on `b` that answers each client message with whatever
/// `script(n, message_type, xid)` returns.  Records the message types
/// it saw.
fn spawn_server(
    sched: &coopnet_core::Scheduler,
    server: Rc<NetStack>,
    script: fn(usize, u8, u32) -> Option<Vec<u8>>,
) -> Rc<RefCell<Vec<u8>>> {
    let seen = Rc::new(RefCell::new(Vec::new()));
    let log = seen.clone();
    server.udp_register(UDP_PORT_SERVER, UdpPortHandler::Enqueue);
    sched.spawn(async move {
        loop {
            let Ok(request) = server.udp_recv(UDP_PORT_SERVER, 0).await else {
                continue;
            };
            let payload = request.payload();
            if payload.len() < BOOTP_HEADER_LEN {
                continue;
            }
            let kind = read_dhcp_options(&payload[BOOTP_HEADER_LEN..]).message_type;
            let n = log.borrow().len();
            log.borrow_mut().push(kind);
            if let Some(reply) = script(n, kind, xid_of(payload)) {
                let _ = send_udp(
                    &server,
                    Ipv4Addr::BROADCAST,
                    UDP_PORT_CLIENT,
                    UDP_PORT_SERVER,
                    &reply,
                )
                .await;
            }
        }
    });
    seen
}

fn answer(kind: u8, xid: u32) -> Option<Vec<u8>> {
    match kind {
        MSG_DISCOVER => Some(server_reply(xid, MSG_OFFER)),
        MSG_REQUEST => Some(server_reply(xid, MSG_ACK)),
        _ => None,
    }
}

// =============================================================================
// Messages
// =============================================================================

fn test_discover_layout() -> TestResult {
    let mut out = [0xEEu8; 300];
    let len = build_discover(MAC_A, 0x1234_5678, &mut out);
    assert_eq_test!(len, BOOTP_HEADER_LEN + 4);
    assert_eq_test!(&out[0..4], &[1u8, 1, 6, 0][..]);
    assert_eq_test!(xid_of(&out), 0x1234_5678);
    assert_eq_test!(&out[10..12], &[0x80u8, 0][..], "broadcast flag");
    assert_eq_test!(&out[12..28], &[0u8; 16][..], "addresses left zero");
    assert_eq_test!(&out[28..34], MAC_A.as_bytes().as_slice());
    assert_eq_test!(&out[236..240], &[0x63u8, 0x82, 0x53, 0x63][..]);
    assert_eq_test!(&out[240..244], &[53u8, 1, MSG_DISCOVER, 255][..]);
    pass!()
}

fn test_request_names_offer_and_server() -> TestResult {
    let offer = DhcpReply {
        your_ip: IP_A,
        next_server: Ipv4Addr::UNSPECIFIED,
        options: DhcpOptions {
            message_type: MSG_OFFER,
            server_id: IP_B,
            ..DhcpOptions::default()
        },
    };
    let mut out = [0u8; 300];
    let len = build_request(MAC_A, 42, &offer, &mut out);
    let opts = read_dhcp_options(&out[BOOTP_HEADER_LEN..len]);
    assert_eq_test!(opts.message_type, MSG_REQUEST);
    assert_eq_test!(opts.server_id, IP_B);
    assert_eq_test!(&out[BOOTP_HEADER_LEN..BOOTP_HEADER_LEN + 6], &[50u8, 4, 10, 0, 0, 1][..]);
    assert_eq_test!(out[len - 1], 255);
    pass!()
}

fn test_options_are_read() -> TestResult {
    let reply = server_reply(1, MSG_ACK);
    let opts = read_dhcp_options(&reply[BOOTP_HEADER_LEN..]);
    assert_eq_test!(opts.message_type, MSG_ACK);
    assert_eq_test!(opts.server_id, IP_B);
    assert_eq_test!(opts.subnet_mask, MASK);
    assert_eq_test!(opts.router, ROUTER);
    assert_eq_test!(opts.dns[0], DNS_1);
    assert_eq_test!(opts.dns[1], DNS_2);
    assert_test!(opts.dns[2].is_unspecified());

    // Padding is skipped; a truncated option ends the walk.
    let opts = read_dhcp_options(&[0, 0, 53, 1, MSG_NAK, 3, 4, 10, 0]);
    assert_eq_test!(opts.message_type, MSG_NAK);
    assert_test!(opts.router.is_unspecified());

    // Nothing after END counts.
    let opts = read_dhcp_options(&[255, 53, 1, MSG_ACK]);
    assert_eq_test!(opts.message_type, 0);
    pass!()
}

fn test_reply_checks() -> TestResult {
    let reply = server_reply(77, MSG_OFFER);
    let parsed = assert_some!(parse_bootp_reply(&reply, 77));
    assert_eq_test!(parsed.your_ip, IP_A);
    assert_eq_test!(parsed.server(), IP_B);
    assert_test!(parse_bootp_reply(&reply, 78).is_none(), "other transaction");
    assert_test!(parse_bootp_reply(&reply[..BOOTP_HEADER_LEN - 1], 77).is_none(), "short");

    let mut request = reply.clone();
    request[0] = 1;
    assert_test!(parse_bootp_reply(&request, 77).is_none(), "not a reply");
    let mut bad_cookie = reply.clone();
    bad_cookie[239] = 0;
    assert_test!(parse_bootp_reply(&bad_cookie, 77).is_none(), "magic cookie");

    // Without option 54 the server is siaddr.
    let mut no_id = reply[..BOOTP_HEADER_LEN].to_vec();
    no_id[20..24].copy_from_slice(&[10, 0, 0, 3]);
    no_id.extend_from_slice(&[53, 1, MSG_OFFER, 255]);
    let parsed = assert_some!(parse_bootp_reply(&no_id, 77));
    assert_eq_test!(parsed.server(), Ipv4Addr::new(10, 0, 0, 3));
    pass!()
}

// =============================================================================
// Client
// =============================================================================

fn test_lease_is_installed() -> TestResult {
    let sched = new_sched();
    let s = sched.clone();
    let result = sched.run(async move {
        let net = pair_with(&s, NetConfig::default(), NetConfig::with_address(IP_B, MASK));
        let seen = spawn_server(&s, net.b.clone(), |_, kind, xid| answer(kind, xid));

        let lease = net.a.dhcp_configure().await;
        assert_eq_test!(lease.ip, IP_A);
        assert_eq_test!(lease.server, IP_B);
        assert_eq_test!(seen.borrow().clone(), std::vec![MSG_DISCOVER, MSG_REQUEST]);

        let cfg = net.a.config();
        assert_eq_test!(cfg.ip, IP_A);
        assert_eq_test!(cfg.mask, MASK);
        assert_eq_test!(cfg.router, ROUTER);
        assert_eq_test!(&cfg.dns[..2], &[DNS_1, DNS_2][..]);
        assert_test!(!net.a.udp_port_bound(UDP_PORT_CLIENT), "client port released");
        pass!()
    });
    sched.shutdown();
    result
}

fn test_stray_transactions_are_ignored() -> TestResult {
    let sched = new_sched();
    let s = sched.clone();
    let result = sched.run(async move {
        let net = pair_with(&s, NetConfig::default(), NetConfig::with_address(IP_B, MASK));
        // Every offer is for someone else's transaction.
        let seen = spawn_server(&s, net.b.clone(), |_, kind, xid| {
            if kind == MSG_DISCOVER {
                Some(server_reply(xid.wrapping_add(1), MSG_OFFER))
            } else {
                None
            }
        });
        let client = net.a.clone();
        s.spawn(async move {
            client.dhcp_configure().await;
        });

        s.sleep(12_000_000).await;
        assert_test!(net.a.config().ip.is_unspecified(), "took an offer for another xid");
        assert_test!(seen.borrow().len() >= 2, "rounds repeat after the timeout");
        assert_test!(seen.borrow().iter().all(|&k| k == MSG_DISCOVER));
        pass!()
    });
    sched.shutdown();
    result
}

fn test_nak_restarts_the_exchange() -> TestResult {
    let sched = new_sched();
    let s = sched.clone();
    let result = sched.run(async move {
        let net = pair_with(&s, NetConfig::default(), NetConfig::with_address(IP_B, MASK));
        let seen = spawn_server(&s, net.b.clone(), |n, kind, xid| {
            if n == 1 && kind == MSG_REQUEST {
                Some(server_reply(xid, MSG_NAK))
            } else {
                answer(kind, xid)
            }
        });
        let lease = net.a.dhcp_configure().await;
        assert_eq_test!(lease.ip, IP_A);
        assert_eq_test!(
            seen.borrow().clone(),
            std::vec![MSG_DISCOVER, MSG_REQUEST, MSG_DISCOVER, MSG_REQUEST]
        );
        pass!()
    });
    sched.shutdown();
    result
}

fn test_silent_network_is_retried() -> TestResult {
    let sched = new_sched();
    let s = sched.clone();
    let result = sched.run(async move {
        let net = pair_with(&s, NetConfig::default(), NetConfig::with_address(IP_B, MASK));
        // The first two discovers go unanswered.
        let seen = spawn_server(&s, net.b.clone(), |n, kind, xid| {
            if n < 2 { None } else { answer(kind, xid) }
        });
        let start = s.now();
        let lease = net.a.dhcp_configure().await;
        assert_eq_test!(lease.ip, IP_A);
        assert_eq_test!(seen.borrow().len(), 4);
        assert_test!(s.now() - start >= 2 * 5_000_000, "two timed-out rounds");
        pass!()
    });
    sched.shutdown();
    result
}

coopnet_lib::define_test_suite!(
    dhcp,
    [
        test_discover_layout,
        test_request_names_offer_and_server,
        test_options_are_read,
        test_reply_checks,
        test_lease_is_installed,
        test_stray_transactions_are_ignored,
        test_nak_restarts_the_exchange,
        test_silent_network_is_retried,
    ]
);
