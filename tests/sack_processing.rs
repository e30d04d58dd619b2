mod common;

use common::*;
use rustsctp::chunk::Sack;
use rustsctp::gap_list::GapBlock;
use rustsctp::{Chunk, Indication, OutgoingMessage};
use std::time::Instant;

fn send_messages(assoc: &mut rustsctp::Association<rustsctp::ActionQueue>, count: usize, len: usize) {
    let now = Instant::now();
    for _ in 0..count {
        assoc
            .send(now, OutgoingMessage::new(0, vec![0u8; len]))
            .unwrap();
    }
}

#[test]
fn test_sack_removes_cumulative_and_counts_misses() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut assoc = established(test_config());
    send_messages(&mut assoc, 5, 100);
    let tsns: Vec<u32> = sent_data(&assoc).iter().map(|(d, _)| d.tsn).collect();
    assert_eq!(tsns, vec![1, 2, 3, 4, 5]);
    assert_eq!(assoc.outstanding_bytes(), 500);

    assoc.handle_chunk(Instant::now(), peer_a(), LOCAL_TAG, sack(3, &[(2, 2)]));

    assert!(assoc.queues().get(1).is_none(), "TSN 1 must be dequeued");
    assert!(assoc.queues().get(3).is_none(), "TSN 3 must be dequeued");
    assert_eq!(assoc.queues().get(4).unwrap().gap_reports(), 1, "TSN 4 missed once");
    assert!(assoc.queues().get(5).unwrap().flags().acked, "TSN 5 gap acked");
    assert_eq!(assoc.outstanding_bytes(), 100, "only TSN 4 stays outstanding");
    assert_eq!(assoc.peer_cum_tsn_ack(), 3);
    assert_eq!(assoc.highest_tsn_acked(), 5);
}

#[test]
fn test_fast_retransmit_exactly_once() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut assoc = established(test_config());
    send_messages(&mut assoc, 9, 100);
    assoc.context_mut().clear();

    for round in 1..=3 {
        assoc.handle_chunk(Instant::now(), peer_a(), LOCAL_TAG, sack(5, &[(2, 4)]));
        let resent: Vec<u32> = sent_data(&assoc).iter().map(|(d, _)| d.tsn).collect();
        if round < 3 {
            assert!(resent.is_empty(), "no retransmission after {} SACK(s)", round);
        } else {
            assert_eq!(resent, vec![6], "TSN 6 fast retransmitted on the third SACK");
        }
    }
    let primary = assoc.primary_path().unwrap();
    assert!(primary.in_fast_recovery(), "loss must start fast recovery");

    assoc.context_mut().clear();
    assoc.handle_chunk(Instant::now(), peer_a(), LOCAL_TAG, sack(5, &[(2, 4)]));
    assert!(
        sent_data(&assoc).is_empty(),
        "a fourth identical SACK must not retransmit again"
    );
    assert_eq!(assoc.queues().get(6).unwrap().transmissions(), 2);
}

#[test]
fn test_sack_guard_sequence_discards_replays() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut assoc = established(test_config());
    send_messages(&mut assoc, 3, 100);
    let guarded = |sequence| {
        Chunk::Sack(Sack {
            cum_tsn_ack: 0,
            a_rwnd: PEER_RWND,
            gap_blocks: vec![GapBlock::new(2, 3)],
            sequence: Some(sequence),
            ..Default::default()
        })
    };
    assoc.handle_chunk(Instant::now(), peer_a(), LOCAL_TAG, guarded(7));
    assoc.handle_chunk(Instant::now(), peer_a(), LOCAL_TAG, guarded(7));
    assoc.handle_chunk(Instant::now(), peer_a(), LOCAL_TAG, guarded(6));
    assert_eq!(
        assoc.queues().get(1).unwrap().gap_reports(),
        1,
        "replayed SACKs must not add miss indications"
    );
}

#[test]
fn test_malformed_gap_list_is_discarded() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut assoc = established(test_config());
    send_messages(&mut assoc, 4, 100);
    // Overlapping blocks.
    assoc.handle_chunk(Instant::now(), peer_a(), LOCAL_TAG, sack(0, &[(2, 3), (3, 4)]));
    assert!(!assoc.queues().get(2).unwrap().flags().acked);
    assert_eq!(assoc.outstanding_bytes(), 400);
}

#[test]
fn test_renege_restores_outstanding_and_timer() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut assoc = established(test_config());
    send_messages(&mut assoc, 4, 100);

    assoc.handle_chunk(Instant::now(), peer_a(), LOCAL_TAG, sack(1, &[(2, 3)]));
    assert_eq!(assoc.outstanding_bytes(), 100, "TSN 2 is the only hole");

    // Gaps vanish: the peer dropped TSNs 3 and 4.
    assoc.handle_chunk(Instant::now(), peer_a(), LOCAL_TAG, sack(1, &[]));
    let chunk = assoc.queues().get(4).unwrap();
    assert!(!chunk.flags().acked && chunk.flags().reneged);
    assert_eq!(chunk.gap_reports(), 1);
    assert_eq!(assoc.outstanding_bytes(), 300, "reneged bytes count again");
    assert_eq!(assoc.highest_tsn_acked(), 1);
}

#[test]
fn test_nr_sack_frees_chunks() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut assoc = established(test_config());
    send_messages(&mut assoc, 3, 100);
    let nr = Chunk::Sack(Sack {
        cum_tsn_ack: 0,
        a_rwnd: PEER_RWND,
        nr_gap_blocks: vec![GapBlock::new(2, 3)],
        ..Default::default()
    });
    assoc.handle_chunk(Instant::now(), peer_a(), LOCAL_TAG, nr);
    assert!(assoc.queues().get(2).is_none(), "non-revocably acked chunks are freed");
    assert!(assoc.queues().get(3).is_none());
    assert!(assoc.queues().get(1).is_some());
    assert!(
        indications(&assoc)
            .iter()
            .any(|i| matches!(i, Indication::SendQueueAbated { .. })),
        "freeing send buffer must be reported"
    );
}

#[test]
fn test_rtt_sample_updates_rto() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut assoc = established(test_config());
    let sent_at = Instant::now();
    assoc.send(sent_at, OutgoingMessage::new(0, vec![1u8; 10])).unwrap();
    let before = assoc.primary_path().unwrap().srtt();
    assert!(before.is_none());
    assoc.handle_chunk(
        sent_at + std::time::Duration::from_millis(80),
        peer_a(),
        LOCAL_TAG,
        sack(1, &[]),
    );
    let srtt = assoc.primary_path().unwrap().srtt().unwrap();
    assert!(srtt.as_millis() >= 79 && srtt.as_millis() <= 81, "srtt {:?}", srtt);
    assert_eq!(assoc.primary_path().unwrap().rto(), assoc.config().rto_min);
}

#[test]
fn test_replayed_sack_without_guard_changes_nothing() {
    let _ = env_logger::builder().is_test(true).try_init();
    let config = rustsctp::SctpConfig {
        check_sack_sequence: false,
        ..test_config()
    };
    let mut assoc = established(config);
    let sent_at = Instant::now();
    send_messages(&mut assoc, 4, 100);

    let ack = sack(2, &[(2, 2)]);
    let first = sent_at + std::time::Duration::from_millis(50);
    assoc.handle_chunk(first, peer_a(), LOCAL_TAG, ack.clone());
    let outstanding = assoc.outstanding_bytes();
    let srtt = assoc.primary_path().unwrap().srtt();
    assert_eq!(outstanding, 100, "only TSN 3 stays outstanding");
    assert!(srtt.is_some());

    assoc.handle_chunk(first + std::time::Duration::from_millis(50), peer_a(), LOCAL_TAG, ack);
    assert_eq!(assoc.outstanding_bytes(), outstanding);
    assert_eq!(assoc.primary_path().unwrap().srtt(), srtt, "a replay yields no RTT sample");
    assert_eq!(assoc.peer_cum_tsn_ack(), 2);
    assert!(assoc.queues().get(4).unwrap().flags().acked);
}

#[test]
fn test_peer_window_subtracts_outstanding_bytes() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut assoc = established(test_config());
    send_messages(&mut assoc, 4, 100);

    let with_window = |a_rwnd| {
        Chunk::Sack(Sack {
            cum_tsn_ack: 2,
            a_rwnd,
            ..Default::default()
        })
    };
    assoc.handle_chunk(Instant::now(), peer_a(), LOCAL_TAG, with_window(1000));
    assert_eq!(assoc.outstanding_bytes(), 200);
    assert_eq!(assoc.peer_rwnd(), 800, "advertised window less what is in flight");

    assoc.handle_chunk(Instant::now(), peer_a(), LOCAL_TAG, with_window(50));
    assert_eq!(assoc.peer_rwnd(), 0, "window smaller than the flight saturates at zero");
}
