//! LAN session integration tests over localhost sockets.

use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use kestrel_net::config::NetConfig;
use kestrel_net::console::MpInterface;
use kestrel_net::discovery::DiscoveryConfig;
use kestrel_net::lan::LanSession;
use kestrel_netproto::constants::{LOCALHOST, REPLY_SLOT_SIZE};
use kestrel_netproto::player::PlayerStatus;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info")
        .with_test_writer()
        .try_init();
}

fn test_config() -> NetConfig {
    NetConfig {
        player_name: "test".into(),
        ..NetConfig::default()
    }
}

/// Poll `cond` every 20 ms until it holds or `secs` elapse.
fn wait_for(secs: u64, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(secs);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    cond()
}

#[test]
fn three_way_join_settles_player_lists() {
    init_tracing();

    let host = LanSession::new(&test_config());
    host.start_host("H", 4, 0).unwrap();
    let port = host.game_port();

    let c1 = LanSession::new(&test_config());
    c1.start_client("C1", "127.0.0.1", port).unwrap();
    let c2 = LanSession::new(&test_config());
    c2.start_client("C2", "127.0.0.1", port).unwrap();

    let sessions = [&host, &c1, &c2];
    assert!(
        wait_for(5, || sessions.iter().all(|s| s.player_list().len() == 3)),
        "player lists did not settle"
    );

    for session in sessions {
        let list = session.player_list();
        let mut ids: Vec<u8> = list.iter().map(|p| p.id).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![0, 1, 2]);

        let host_entry = list.iter().find(|p| p.id == 0).unwrap();
        assert_eq!(host_entry.status, PlayerStatus::Host);

        let own = list
            .iter()
            .find(|p| p.id == session.local_player_id())
            .unwrap();
        assert!(own.is_local);
        assert_eq!(own.address, LOCALHOST);
    }

    assert_eq!(host.num_players(), 3);
    assert_eq!(host.max_players(), 4);

    c2.end_session();
    c1.end_session();
    host.end_session();
}

#[test]
fn end_session_twice_is_a_no_op() {
    init_tracing();
    let host = LanSession::new(&test_config());
    host.start_host("H", 2, 0).unwrap();
    assert!(host.is_active());
    host.end_session();
    assert!(!host.is_active());
    host.end_session();
    assert!(!host.is_active());
}

#[test]
fn session_capacity_rejects_extra_client() {
    init_tracing();

    // Capacity 2: the host plus one client.
    let host = LanSession::new(&test_config());
    host.start_host("H", 2, 0).unwrap();
    let port = host.game_port();

    let c1 = LanSession::new(&test_config());
    c1.start_client("C1", "127.0.0.1", port).unwrap();
    assert!(wait_for(5, || host.num_players() == 2));

    // The third participant never gets a ClientInit and the handshake
    // fails; the existing players are unaffected.
    let c2 = LanSession::new(&test_config());
    assert!(c2.start_client("C2", "127.0.0.1", port).is_err());
    assert_eq!(host.num_players(), 2);
    assert!(wait_for(5, || c1.player_list().len() == 2));
}

#[test]
fn discovery_lists_hosted_session() {
    init_tracing();

    let discovery = DiscoveryConfig {
        port: 29063,
        broadcast_addr: Ipv4Addr::LOCALHOST,
    };
    let mut host_cfg = test_config();
    host_cfg.discovery = discovery.clone();
    let mut client_cfg = test_config();
    client_cfg.discovery = discovery;

    let host = LanSession::new(&host_cfg);
    host.start_host("A", 4, 0).unwrap();

    let browser = LanSession::new(&client_cfg);
    browser.start_discovery().unwrap();

    let found = wait_for(3, || {
        host.process();
        browser.process();
        !browser.discovery_list().is_empty()
    });
    assert!(found, "beacon never arrived");

    let list = browser.discovery_list();
    let entry = list.values().next().unwrap();
    assert_eq!(entry.beacon.session_name, "A's game");
    assert_eq!(entry.beacon.max_players, 4);
    assert_eq!(entry.beacon.num_players, 1);

    browser.end_discovery();
    host.end_session();
}

#[test]
fn reply_gather_returns_aid_bitmask() {
    init_tracing();

    let host = LanSession::new(&test_config());
    host.start_host("H", 4, 0).unwrap();
    let port = host.game_port();

    let c1 = LanSession::new(&test_config());
    c1.start_client("C1", "127.0.0.1", port).unwrap();
    let c2 = LanSession::new(&test_config());
    c2.start_client("C2", "127.0.0.1", port).unwrap();
    let c3 = LanSession::new(&test_config());
    c3.start_client("C3", "127.0.0.1", port).unwrap();

    let sessions = [&host, &c1, &c2, &c3];
    assert!(wait_for(5, || sessions.iter().all(|s| s.player_list().len() == 4)));

    for session in sessions {
        session.begin();
    }
    // Give the mesh links and the connect notifications a moment.
    std::thread::sleep(Duration::from_millis(200));
    assert!(wait_for(5, || sessions
        .iter()
        .all(|s| s.player_list().len() == 4)));

    // Player 2 issues a command; players 1 and 3 answer with their aids.
    let timestamp = 5_000u64;
    assert_eq!(c2.send_cmd(b"poll", timestamp), 4);

    let mut buf = [0u8; 64];
    for (session, reply) in [(&c1, &b"one"[..]), (&c3, &b"three"[..])] {
        let recv = session
            .recv_host_packet(&mut buf)
            .expect("command should arrive");
        assert_eq!(&buf[..recv.len], b"poll");
        assert_eq!(recv.timestamp, timestamp);
        let aid = session.local_player_id() as u16;
        assert_eq!(session.send_reply(reply, timestamp, aid), reply.len());
    }

    let mut replies = vec![0u8; REPLY_SLOT_SIZE * 15];
    let start = Instant::now();
    let mask = c2.recv_replies(&mut replies, timestamp, 0b1010);
    assert_eq!(mask, 0b1010);
    assert!(start.elapsed() < Duration::from_millis(500));
    assert_eq!(&replies[0..3], b"one");
    assert_eq!(&replies[2 * REPLY_SLOT_SIZE..2 * REPLY_SLOT_SIZE + 5], b"three");

    // With nobody answering, the gather times out and reports nothing.
    let start = Instant::now();
    let mask = c1.recv_replies(&mut replies, timestamp + 10, 0b0100);
    assert_eq!(mask, 0);
    assert!(start.elapsed() < Duration::from_millis(500));

    for session in sessions {
        session.end();
        session.end_session();
    }
}

#[test]
fn stale_mp_packet_is_discarded() {
    init_tracing();

    let host = LanSession::new(&test_config());
    host.start_host("H", 2, 0).unwrap();
    let port = host.game_port();

    let c1 = LanSession::new(&test_config());
    c1.start_client("C1", "127.0.0.1", port).unwrap();
    assert!(wait_for(5, || c1.player_list().len() == 2));

    host.begin();
    c1.begin();
    std::thread::sleep(Duration::from_millis(100));

    // Fresh packet: delivered.
    let mut buf = [0u8; 64];
    assert_eq!(host.send_packet(b"fresh", 1), 5);
    std::thread::sleep(Duration::from_millis(100));
    let recv = c1.recv_packet(&mut buf).expect("fresh packet delivered");
    assert_eq!(&buf[..recv.len], b"fresh");

    // Aged packet: sits in the queue past the 500 ms staleness bound.
    assert_eq!(host.send_packet(b"stale", 2), 5);
    std::thread::sleep(Duration::from_millis(600));
    assert!(c1.recv_packet(&mut buf).is_none());

    c1.end_session();
    host.end_session();
}
