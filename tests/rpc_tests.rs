//! End-to-end tests over UDP loopback.
//!
//! Each test builds a client/server pair on one thread and co-polls both
//! event loops. The wire between them is a real socket, so these exercise
//! the full path: handshake, fragmentation, credit returns, selective
//! retransmission, and teardown.

mod common;

use std::net::UdpSocket;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use common::{check_pattern, fill_pattern, make_pair, make_pair_opts, recording_cont, Pair};
use urpc::packet::{PktHdr, PktKind, PKT_HDR_SIZE};
use urpc::{
    CompletionStatus, ConnectFailure, Error, RejectReason, RpcConfig, SmEvent, UdpTransport,
};

const ECHO_REQ: u8 = common::ECHO_REQ;

fn quick_cfg() -> RpcConfig {
    RpcConfig::default().with_sm_retry_ms(20)
}

/// Run one batch of echo requests of the given sizes and verify every
/// continuation fires exactly once with a byte-exact response.
fn run_echo_batch(pair: &Pair, session: u16, sizes: &[usize], timeout: Duration) {
    let mut bufs = Vec::new();
    for (i, &size) in sizes.iter().enumerate() {
        let mut req = pair.client.alloc_msg_buffer(size).unwrap();
        let resp = pair.client.alloc_msg_buffer(size).unwrap();
        fill_pattern(req.data_mut(), i as u8);
        bufs.push((req, resp));
    }

    let base = pair.client_state.borrow().completed.len();
    let enqueue_deadline = std::time::Instant::now() + timeout;
    for (i, (req, resp)) in bufs.iter().enumerate() {
        loop {
            match pair
                .client
                .enqueue_request(session, ECHO_REQ, req, resp, recording_cont(), i as u64)
            {
                Ok(()) => break,
                Err(Error::NoCredits) => {
                    assert!(
                        std::time::Instant::now() < enqueue_deadline,
                        "credits never returned"
                    );
                    pair.client.run_event_loop_once();
                    pair.server.run_event_loop_once();
                }
                Err(e) => panic!("enqueue failed: {}", e),
            }
        }
    }

    let want = base + sizes.len();
    let ok = pair.poll_until(timeout, || {
        pair.client_state.borrow().completed.len() >= want
    });
    assert!(ok, "only {}/{} echoes completed",
        pair.client_state.borrow().completed.len() - base, sizes.len());

    let state = pair.client_state.borrow();
    let batch = &state.completed[base..];
    assert_eq!(batch.len(), sizes.len());
    for &(tag, status, ref data) in batch {
        assert_eq!(status, CompletionStatus::Success);
        let i = tag as usize;
        assert_eq!(data.len(), sizes[i], "response size mismatch for tag {}", tag);
        assert_eq!(data[0], i as u8);
        assert!(check_pattern(data), "payload mismatch for tag {}", tag);
    }
    drop(state);

    for (req, resp) in bufs {
        pair.client.free_msg_buffer(req);
        pair.client.free_msg_buffer(resp);
    }
}

// =============================================================================
// Basic echo
// =============================================================================

#[test]
fn test_echo_small() {
    let pair = make_pair(quick_cfg(), quick_cfg());
    let session = pair.connect();

    let mut req = pair.client.alloc_msg_buffer(16).unwrap();
    let resp = pair.client.alloc_msg_buffer(16).unwrap();
    for (i, b) in req.data_mut().iter_mut().enumerate() {
        *b = i as u8;
    }

    pair.client
        .enqueue_request(session, ECHO_REQ, &req, &resp, recording_cont(), 7)
        .unwrap();

    let ok = pair.poll_until(Duration::from_secs(5), || {
        !pair.client_state.borrow().completed.is_empty()
    });
    assert!(ok, "echo did not complete");

    let state = pair.client_state.borrow();
    assert_eq!(state.completed.len(), 1);
    let (tag, status, ref data) = state.completed[0];
    assert_eq!(tag, 7);
    assert_eq!(status, CompletionStatus::Success);
    assert_eq!(data.len(), 16);
    assert_eq!(data, &(0u8..16).collect::<Vec<_>>());
}

#[test]
fn test_echo_boundary_sizes() {
    let pair = make_pair(quick_cfg(), quick_cfg());
    let session = pair.connect();
    let p = pair.client.max_data_per_pkt();

    // One fragment exactly at the MTU payload, two just past it.
    let one_pkt = pair.client.alloc_msg_buffer(p).unwrap();
    assert_eq!(one_pkt.num_pkts(), 1);
    let two_pkt = pair.client.alloc_msg_buffer(p + 1).unwrap();
    assert_eq!(two_pkt.num_pkts(), 2);
    pair.client.free_msg_buffer(one_pkt);
    pair.client.free_msg_buffer(two_pkt);

    run_echo_batch(&pair, session, &[p], Duration::from_secs(5));
    run_echo_batch(&pair, session, &[p + 1], Duration::from_secs(5));
}

#[test]
fn test_echo_max_msg_size() {
    let cfg = quick_cfg().with_max_msg_size(256 * 1024);
    let pair = make_pair(cfg.clone(), cfg);
    let session = pair.connect();

    run_echo_batch(
        &pair,
        session,
        &[pair.client.config().max_msg_size],
        Duration::from_secs(30),
    );
}

#[test]
fn test_echo_large_concurrent() {
    let cfg = quick_cfg().with_max_msg_size(64 * 1024);
    let pair = make_pair(cfg.clone(), cfg);
    let session = pair.connect();
    let p = pair.client.max_data_per_pkt();

    let mut rng = StdRng::seed_from_u64(42);
    let sizes: Vec<usize> = (0..urpc::SESSION_CREDITS)
        .map(|_| rng.gen_range(p + 1..=64 * 1024))
        .collect();
    run_echo_batch(&pair, session, &sizes, Duration::from_secs(30));
}

#[test]
fn test_resize_round_trips_through_engine() {
    let pair = make_pair(quick_cfg(), quick_cfg());
    let session = pair.connect();

    // A buffer resized down travels at its logical size.
    let mut req = pair.client.alloc_msg_buffer(4096).unwrap();
    let resp = pair.client.alloc_msg_buffer(4096).unwrap();
    pair.client.resize_msg_buffer(&mut req, 100).unwrap();
    fill_pattern(req.data_mut(), 9);

    pair.client
        .enqueue_request(session, ECHO_REQ, &req, &resp, recording_cont(), 0)
        .unwrap();
    let ok = pair.poll_until(Duration::from_secs(5), || {
        !pair.client_state.borrow().completed.is_empty()
    });
    assert!(ok);
    let state = pair.client_state.borrow();
    assert_eq!(state.completed[0].2.len(), 100);
    assert!(check_pattern(&state.completed[0].2));
}

// =============================================================================
// Flow control
// =============================================================================

#[test]
fn test_credits_exhausted() {
    let pair = make_pair(quick_cfg(), quick_cfg());
    let session = pair.connect();
    let credits = pair.client.config().session_credits;

    let mut bufs = Vec::new();
    for i in 0..credits {
        let mut req = pair.client.alloc_msg_buffer(64).unwrap();
        let resp = pair.client.alloc_msg_buffer(64).unwrap();
        fill_pattern(req.data_mut(), i as u8);
        pair.client
            .enqueue_request(session, ECHO_REQ, &req, &resp, recording_cont(), i as u64)
            .unwrap();
        bufs.push((req, resp));
    }
    assert_eq!(pair.client.available_credits(session), Some(0));

    // One more must fail without blocking.
    let req = pair.client.alloc_msg_buffer(64).unwrap();
    let resp = pair.client.alloc_msg_buffer(64).unwrap();
    let err = pair
        .client
        .enqueue_request(session, ECHO_REQ, &req, &resp, recording_cont(), 99)
        .unwrap_err();
    assert!(matches!(err, Error::NoCredits));

    // Draining the loop returns the credits.
    let ok = pair.poll_until(Duration::from_secs(5), || {
        pair.client_state.borrow().completed.len() == credits
    });
    assert!(ok);
    assert_eq!(pair.client.available_credits(session), Some(credits));
}

#[test]
fn test_connect_rejected_when_window_full() {
    // A server window of one session's credits admits exactly one session.
    let server_cfg = quick_cfg().with_unexp_pkt_window(urpc::SESSION_CREDITS);
    let pair = make_pair(server_cfg, quick_cfg());

    let first = pair.connect();
    let second = pair.client.create_session(&pair.server_uri(), 0).unwrap();
    let ok = pair.poll_until(Duration::from_secs(5), || {
        pair.client_state.borrow().sm_events.iter().any(|&(s, ev)| {
            s == second
                && ev
                    == SmEvent::ConnectFailed(ConnectFailure::Rejected(
                        RejectReason::NoRingEntriesAvailable,
                    ))
        })
    });
    assert!(ok, "second session was not rejected");
    let _ = first;
}

#[test]
fn test_sessions_beyond_default_window() {
    // More sessions than the default window admits, window raised to fit:
    // the per-session credit machinery bounds concurrent reception.
    let n_sessions = urpc::UNEXP_PKT_WINDOW / urpc::SESSION_CREDITS + 2;
    let server_cfg = quick_cfg()
        .with_unexp_pkt_window(n_sessions * urpc::SESSION_CREDITS)
        .with_max_msg_size(16 * 1024);
    let client_cfg = quick_cfg().with_max_msg_size(16 * 1024);
    let pair = make_pair(server_cfg, client_cfg);
    let p = pair.client.max_data_per_pkt();

    let sessions: Vec<u16> = (0..n_sessions).map(|_| pair.connect()).collect();
    assert_eq!(pair.server.num_active_sessions(), n_sessions);

    let mut rng = StdRng::seed_from_u64(7);
    for _iter in 0..5 {
        for &session in &sessions {
            let sizes: Vec<usize> = (0..4).map(|_| rng.gen_range(p + 1..=16 * 1024)).collect();
            run_echo_batch(&pair, session, &sizes, Duration::from_secs(30));
        }
    }
}

// =============================================================================
// Session management
// =============================================================================

#[test]
fn test_reconnect_after_invalid_rpc_id() {
    // Connect to an RPC id that has no instance yet; with the retry knob
    // set, the session comes up once the instance appears.
    let pair = make_pair(quick_cfg(), quick_cfg().with_retry_connect_on_invalid_rpc_id(true));

    let sn = pair.client.create_session(&pair.server_uri(), 9).unwrap();

    // Let the reject arrive and the deferred retry get scheduled.
    pair.poll_until(Duration::from_millis(500), || false);
    assert!(pair
        .client_state
        .borrow()
        .sm_events
        .iter()
        .all(|&(s, ev)| s != sn || !matches!(ev, SmEvent::ConnectFailed(_))));

    // Bring up the missing instance, reusing the frozen registry.
    let late_state = common::Ctx::default();
    let late_server = urpc::Rpc::new(
        pair.nexus.clone(),
        late_state,
        9,
        Box::new(|_: &mut common::Ctx, _, _| {}),
        UdpTransport::new("127.0.0.1:0").unwrap(),
        quick_cfg(),
    )
    .unwrap();

    let start = std::time::Instant::now();
    let ok = loop {
        pair.client.run_event_loop_once();
        pair.server.run_event_loop_once();
        late_server.run_event_loop_once();
        if pair
            .client_state
            .borrow()
            .sm_events
            .iter()
            .any(|&(s, ev)| s == sn && ev == SmEvent::Connected)
        {
            break true;
        }
        if start.elapsed() > Duration::from_secs(3) {
            break false;
        }
    };
    assert!(ok, "session did not reconnect after the instance appeared");
}

#[test]
fn test_orderly_teardown() {
    let cfg = quick_cfg().with_max_msg_size(32 * 1024);
    let pair = make_pair(cfg.clone(), cfg);
    let session = pair.connect();
    let p = pair.client.max_data_per_pkt();
    let credits = pair.client.config().session_credits;

    let mut bufs = Vec::new();
    for i in 0..credits {
        let mut req = pair.client.alloc_msg_buffer(8 * p).unwrap();
        let resp = pair.client.alloc_msg_buffer(8 * p).unwrap();
        fill_pattern(req.data_mut(), i as u8);
        pair.client
            .enqueue_request(session, ECHO_REQ, &req, &resp, recording_cont(), i as u64)
            .unwrap();
        bufs.push((req, resp));
    }

    // Make partial progress, then tear the session down mid-flight.
    for _ in 0..20 {
        pair.client.run_event_loop_once();
        pair.server.run_event_loop_once();
    }
    pair.client.destroy_session(session).unwrap();

    // Every continuation fires exactly once, successfully or reset.
    let state = pair.client_state.borrow();
    assert_eq!(state.completed.len(), credits);
    for &(_, status, ref data) in &state.completed {
        match status {
            CompletionStatus::Success => assert_eq!(data.len(), 8 * p),
            CompletionStatus::SessionReset => assert_eq!(data.len(), 0),
        }
    }
    drop(state);

    // Both sides drain to zero sessions without hanging.
    let ok = pair.poll_until(Duration::from_secs(5), || {
        pair.client.num_active_sessions() == 0 && pair.server.num_active_sessions() == 0
    });
    assert!(ok, "teardown did not drain");
    assert!(pair
        .client_state
        .borrow()
        .sm_events
        .iter()
        .any(|&(s, ev)| s == session && ev == SmEvent::Disconnected));
}

// =============================================================================
// Reliability
// =============================================================================

#[test]
fn test_stale_packet_rejected() {
    let pair = make_pair(quick_cfg(), quick_cfg());
    let session = pair.connect();
    run_echo_batch(&pair, session, &[64], Duration::from_secs(5));

    let completed = pair.client_state.borrow().completed.len();
    let dropped = pair.client.num_rx_dropped();

    // Forge a response for the request number the client already retired.
    let hdr = PktHdr::new(ECHO_REQ, 64, session, PktKind::SmallResp, 0, 0);
    let mut pkt = vec![0u8; PKT_HDR_SIZE + 64];
    unsafe { hdr.write_to(pkt.as_mut_ptr()) };
    let sock = UdpSocket::bind("127.0.0.1:0").unwrap();
    sock.send_to(&pkt, pair.client.transport().local_addr())
        .unwrap();

    let saw_drop = pair.poll_until(Duration::from_secs(2), || {
        pair.client.num_rx_dropped() > dropped
    });
    assert!(saw_drop, "stale packet was not counted as dropped");
    assert_eq!(pair.client_state.borrow().completed.len(), completed);
}

#[test]
fn test_packet_drop_soak() {
    let mut cfg = quick_cfg().with_max_msg_size(4096);
    cfg.rto_min_us = 2000;
    // Five-percent loss can occasionally hit the same fragment several
    // times in a row; give the RTO more headroom before declaring the
    // session dead.
    cfg.rto_max_doublings = 6;
    let pair = make_pair(cfg.clone(), cfg);
    let session = pair.connect();
    let p = pair.client.max_data_per_pkt();

    pair.client.fault_inject_set_pkt_drop_prob(0.05);
    pair.server.fault_inject_set_pkt_drop_prob(0.05);

    let mut rng = StdRng::seed_from_u64(3);
    let mut mapped_after_warmup = 0;
    for iter in 0..500 {
        let sizes: Vec<usize> = (0..urpc::SESSION_CREDITS)
            .map(|_| rng.gen_range(p + 1..=4096))
            .collect();
        run_echo_batch(&pair, session, &sizes, Duration::from_secs(30));

        if iter == 50 {
            mapped_after_warmup = pair.client.mem_mapped_bytes() + pair.server.mem_mapped_bytes();
        }
    }

    assert!(pair.client.num_re_tx() + pair.server.num_re_tx() > 0);
    // All 4000 continuations fired (run_echo_batch asserts each batch),
    // and the allocators stopped growing after warmup.
    assert_eq!(
        pair.client.mem_mapped_bytes() + pair.server.mem_mapped_bytes(),
        mapped_after_warmup
    );
}

// =============================================================================
// Background handlers
// =============================================================================

#[test]
fn test_background_echo() {
    let pair = make_pair_opts(quick_cfg(), quick_cfg(), 2);
    let session = pair.connect();

    let mut bufs = Vec::new();
    for i in 0..4u64 {
        let mut req = pair.client.alloc_msg_buffer(256).unwrap();
        let resp = pair.client.alloc_msg_buffer(256).unwrap();
        fill_pattern(req.data_mut(), i as u8);
        pair.client
            .enqueue_request(session, common::ECHO_REQ_BG, &req, &resp, recording_cont(), i)
            .unwrap();
        bufs.push((req, resp));
    }

    let ok = pair.poll_until(Duration::from_secs(5), || {
        pair.client_state.borrow().completed.len() == 4
    });
    assert!(ok, "background echoes did not complete");
    for &(tag, status, ref data) in pair.client_state.borrow().completed.iter() {
        assert_eq!(status, CompletionStatus::Success);
        assert_eq!(data.len(), 256);
        assert_eq!(data[0], tag as u8);
        assert!(check_pattern(data));
    }
}

// =============================================================================
// Telemetry
// =============================================================================

#[test]
fn test_batch_telemetry_moves() {
    let pair = make_pair(quick_cfg(), quick_cfg());
    let session = pair.connect();
    run_echo_batch(&pair, session, &[64, 64, 64, 64], Duration::from_secs(5));

    assert!(pair.client.avg_tx_batch() >= 1.0);
    assert!(pair.server.avg_rx_batch() >= 1.0);
    assert!(pair.client.sec_since_creation() > 0.0);

    pair.client.reset_dpath_stats();
    assert_eq!(pair.client.num_re_tx(), 0);
    assert_eq!(pair.client.avg_tx_batch(), 0.0);
}
