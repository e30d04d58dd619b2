mod common;

use common::*;
use rustsctp::congestion::CongestionController;
use rustsctp::path::Path;
use rustsctp::{ActionQueue, Association, OutgoingMessage, SctpConfig, TimerId};
use std::time::Instant;

// Congestion window behavior of a single-homed association under loss,
// as seen when a relay rate-limits the path.

const MESSAGE: usize = 1000;

fn unlimited_config() -> SctpConfig {
    SctpConfig {
        max_burst: 0,
        ..test_config()
    }
}

fn fill(assoc: &mut Association<ActionQueue>, count: usize) {
    let now = Instant::now();
    for _ in 0..count {
        assoc
            .send(now, OutgoingMessage::new(0, vec![0u8; MESSAGE]))
            .unwrap();
    }
}

fn window(assoc: &Association<ActionQueue>) -> (usize, usize, usize) {
    let path = assoc.primary_path().unwrap();
    (path.cwnd(), path.ssthresh(), path.outstanding_bytes())
}

#[test]
fn test_initial_burst_is_bounded_by_cwnd() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut assoc = established(unlimited_config());
    let (cwnd, ssthresh, _) = window(&assoc);
    assert_eq!(cwnd, 4380, "initial window is max(2*MTU, 4380)");
    assert_eq!(ssthresh, PEER_RWND as usize);

    fill(&mut assoc, 10);
    let sent = sent_data(&assoc).len();
    assert_eq!(sent, 5, "sending stops once outstanding reaches cwnd");
    assert_eq!(window(&assoc).2, 5 * MESSAGE);
    assert_eq!(assoc.streams().queued_bytes(), 5 * MESSAGE);
}

#[test]
fn test_rto_timeout_collapses_window() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut assoc = established(unlimited_config());
    let pmtu = assoc.config().pmtu;
    fill(&mut assoc, 5);
    let path_a = assoc.path(peer_a()).unwrap().id();
    assoc.context_mut().clear();

    assoc.handle_timeout(Instant::now(), TimerId::Retransmission(path_a));

    let (cwnd, ssthresh, outstanding) = window(&assoc);
    assert_eq!(cwnd, pmtu, "cwnd drops to one MTU");
    assert_eq!(ssthresh, 4 * pmtu, "ssthresh is max(cwnd/2, 4*MTU)");
    let resent: Vec<u32> = sent_data(&assoc).iter().map(|(d, _)| d.tsn).collect();
    assert_eq!(resent, vec![1, 2], "only what fits the collapsed window is resent");
    assert_eq!(outstanding, 2 * MESSAGE);
}

#[test]
fn test_repeated_timeouts_keep_threshold_floor() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut assoc = established(unlimited_config());
    let pmtu = assoc.config().pmtu;
    fill(&mut assoc, 5);
    let path_a = assoc.path(peer_a()).unwrap().id();

    let mut previous = usize::MAX;
    for round in 1..=4 {
        assoc.handle_timeout(Instant::now(), TimerId::Retransmission(path_a));
        let (cwnd, ssthresh, _) = window(&assoc);
        assert_eq!(cwnd, pmtu, "round {}: cwnd after timeout", round);
        assert!(ssthresh >= 4 * pmtu, "round {}: ssthresh floor", round);
        assert!(ssthresh <= previous, "round {}: ssthresh never grows", round);
        previous = ssthresh;
    }
}

#[test]
fn test_slow_start_needs_full_window() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut assoc = established(unlimited_config());
    let pmtu = assoc.config().pmtu;

    fill(&mut assoc, 1);
    assoc.handle_chunk(Instant::now(), peer_a(), LOCAL_TAG, sack(1, &[]));
    assert_eq!(window(&assoc).0, 4380, "an underused window does not grow");

    fill(&mut assoc, 6);
    assoc.handle_chunk(Instant::now(), peer_a(), LOCAL_TAG, sack(6, &[]));
    assert_eq!(
        window(&assoc).0,
        4380 + pmtu,
        "a full window grows by at most one MTU per SACK"
    );
}

#[test]
fn test_gap_acks_do_not_grow_window_without_cum_advance() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut assoc = established(unlimited_config());
    fill(&mut assoc, 5);
    // TSN 1 missing, 2..5 gap acked: the pseudo-cumulative ack of the path
    // does not move.
    assoc.handle_chunk(Instant::now(), peer_a(), LOCAL_TAG, sack(0, &[(2, 5)]));
    assert_eq!(window(&assoc).0, 4380);
}

#[test]
fn test_fast_recovery_halves_once() {
    let _ = env_logger::builder().is_test(true).try_init();
    let config = SctpConfig {
        max_burst: 0,
        ..test_config()
    };
    let mut assoc = established(config);
    let pmtu = assoc.config().pmtu;
    fill(&mut assoc, 5);

    for _ in 0..3 {
        assoc.handle_chunk(Instant::now(), peer_a(), LOCAL_TAG, sack(0, &[(2, 5)]));
    }
    let path = assoc.primary_path().unwrap();
    assert!(path.in_fast_recovery());
    let (cwnd, ssthresh, _) = window(&assoc);
    assert_eq!(ssthresh, (4380 - 4380 / 2).max(4 * pmtu));
    assert_eq!(cwnd, ssthresh);

    // Further miss reports while recovering leave the window alone.
    assoc.handle_chunk(Instant::now(), peer_a(), LOCAL_TAG, sack(0, &[(2, 5)]));
    assert_eq!(window(&assoc).0, cwnd);

    // Acking past the exit point ends recovery.
    assoc.handle_chunk(Instant::now(), peer_a(), LOCAL_TAG, sack(5, &[]));
    assert!(!assoc.primary_path().unwrap().in_fast_recovery());
}

#[test]
fn test_max_burst_limits_window_after_sack() {
    let _ = env_logger::builder().is_test(true).try_init();
    let config = SctpConfig {
        max_burst: 1,
        ..test_config()
    };
    let mut assoc = established(config);
    let pmtu = assoc.config().pmtu;
    fill(&mut assoc, 5);
    assoc.handle_chunk(Instant::now(), peer_a(), LOCAL_TAG, sack(4, &[]));
    let cwnd = window(&assoc).0;
    assert!(
        cwnd <= MESSAGE + pmtu,
        "cwnd {} limited to outstanding plus one packet",
        cwnd
    );
}

/// Keeps every path at a constant window.
#[derive(Debug)]
struct FixedWindow(usize);

impl CongestionController for FixedWindow {
    fn initialize(&self, path: &mut Path, _peer_rwnd: u32) {
        path.set_window(self.0, self.0);
    }

    fn on_bytes_acked(&self, _path: &mut Path, _acked: usize, _cum_advanced: bool) {}

    fn on_loss_detected(&self, _path: &mut Path, _highest_outstanding: u32) -> bool {
        false
    }

    fn on_cum_ack(&self, _path: &mut Path, _cum_tsn_ack: u32) {}

    fn on_retransmission_timeout(&self, _path: &mut Path) {}

    fn limit_burst(&self, _path: &mut Path, _max_burst: usize) {}

    fn on_idle(&self, _path: &mut Path) {}
}

#[test]
fn test_custom_controller_governs_sending() {
    let _ = env_logger::builder().is_test(true).try_init();
    let assoc = Association::with_initial_values(
        test_config(),
        ActionQueue::default(),
        LOCAL_TAG,
        LOCAL_INITIAL_TSN,
    )
    .unwrap()
    .with_congestion_controller(Box::new(FixedWindow(2 * MESSAGE)));
    let mut assoc = handshake(assoc);

    fill(&mut assoc, 4);
    assert_eq!(sent_data(&assoc).len(), 2, "window of two messages");

    let path_a = assoc.path(peer_a()).unwrap().id();
    assoc.handle_timeout(Instant::now(), TimerId::Retransmission(path_a));
    assert_eq!(window(&assoc).0, 2 * MESSAGE, "timeouts leave the window alone");
}
