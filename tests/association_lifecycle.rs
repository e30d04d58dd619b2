mod common;

use bytes::Bytes;
use common::*;
use rustsctp::chunk::{
    Asconf, AsconfParam, AsconfRequest, CAUSE_DELETE_SOURCE_ADDRESS, CAUSE_INVALID_STREAM,
    CAUSE_NO_USER_DATA, CAUSE_USER_INITIATED_ABORT, Init,
};
use rustsctp::{
    ActionQueue, Association, AssociationState, Chunk, ConnectionLossReason, Indication,
    OutgoingMessage, Packet, SctpConfig, TimerId,
};
use std::time::Instant;

fn closed(config: SctpConfig) -> Association<ActionQueue> {
    Association::with_initial_values(config, ActionQueue::default(), LOCAL_TAG, LOCAL_INITIAL_TSN)
        .unwrap()
}

fn peer_init() -> Init {
    Init {
        cookie: None,
        ..peer_init_ack()
    }
}

fn last_sack(assoc: &Association<ActionQueue>) -> rustsctp::chunk::Sack {
    sent_chunks(assoc)
        .into_iter()
        .rev()
        .find_map(|c| match c {
            Chunk::Sack(s) => Some(s),
            _ => None,
        })
        .expect("a SACK was sent")
}

#[test]
fn test_passive_handshake() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut assoc = closed(test_config());
    let now = Instant::now();

    assoc.handle_chunk(now, peer_a(), 0, Chunk::Init(peer_init()));
    assert_eq!(assoc.state(), AssociationState::Closed, "INIT leaves no state");
    let cookie = sent_chunks(&assoc)
        .into_iter()
        .find_map(|c| match c {
            Chunk::InitAck(ack) => ack.cookie,
            _ => None,
        })
        .expect("INIT ACK with a cookie");
    assert_eq!(assoc.verification_tag_for(&Chunk::InitAck(peer_init())), PEER_TAG);

    assoc.context_mut().clear();
    assoc.handle_chunk(now, peer_a(), LOCAL_TAG, Chunk::CookieEcho { cookie: cookie.clone() });
    assert_eq!(assoc.state(), AssociationState::Established);
    assert_eq!(sent_chunks(&assoc), vec![Chunk::CookieAck]);
    assert!(indications(&assoc).contains(&Indication::CommunicationUp));
    assert_eq!(assoc.received().cum_ack_tsn(), PEER_INITIAL_TSN - 1);
    assert!(assoc.path(peer_a()).unwrap().is_confirmed());

    // A repeated COOKIE ECHO means our COOKIE ACK got lost.
    assoc.context_mut().clear();
    assoc.handle_chunk(now, peer_a(), LOCAL_TAG, Chunk::CookieEcho { cookie });
    assert_eq!(sent_chunks(&assoc), vec![Chunk::CookieAck]);
}

#[test]
fn test_forged_cookie_is_rejected() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut assoc = closed(test_config());
    let cookie = Bytes::from_static(&[0u8; 40]);
    assoc.handle_chunk(Instant::now(), peer_a(), LOCAL_TAG, Chunk::CookieEcho { cookie });
    assert_eq!(assoc.state(), AssociationState::Closed);
    assert!(sent_chunks(&assoc).is_empty());
}

#[test]
fn test_data_queued_during_handshake_flows_once_established() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut assoc = closed(test_config());
    let now = Instant::now();
    assoc.connect(now, peer_a()).unwrap();
    assoc.send(now, OutgoingMessage::new(0, b"early".to_vec())).unwrap();
    assert!(sent_data(&assoc).is_empty());
    assoc.handle_chunk(now, peer_a(), LOCAL_TAG, Chunk::InitAck(peer_init_ack()));
    assoc.handle_chunk(now, peer_a(), LOCAL_TAG, Chunk::CookieAck);
    let data = sent_data(&assoc);
    assert_eq!(data.len(), 1);
    assert_eq!(data[0].0.payload, Bytes::from_static(b"early"));
}

#[test]
fn test_init_retransmissions_give_up() {
    let _ = env_logger::builder().is_test(true).try_init();
    let config = SctpConfig {
        max_init_retransmits: 2,
        ..test_config()
    };
    let mut assoc = closed(config);
    let now = Instant::now();
    assoc.connect(now, peer_a()).unwrap();
    for _ in 0..2 {
        assoc.handle_timeout(now, TimerId::Init);
    }
    let inits = sent_chunks(&assoc)
        .iter()
        .filter(|c| matches!(c, Chunk::Init(_)))
        .count();
    assert_eq!(inits, 3, "original INIT plus two retransmissions");
    assert_eq!(assoc.state(), AssociationState::CookieWait);

    assoc.context_mut().clear();
    assoc.handle_timeout(now, TimerId::Init);
    assert_eq!(assoc.state(), AssociationState::Closed);
    assert!(indications(&assoc).contains(&Indication::ConnectionLost(
        ConnectionLossReason::InitTimeout
    )));
    assert!(
        !sent_chunks(&assoc).iter().any(|c| matches!(c, Chunk::Abort { .. })),
        "no ABORT without a peer tag"
    );
}

#[test]
fn test_receive_data_and_acknowledge() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut assoc = established(test_config());
    let now = Instant::now();
    assoc.handle_chunk(now, peer_a(), LOCAL_TAG, peer_data(PEER_INITIAL_TSN, 0, 0, b"hello"));
    let messages = delivered(&assoc);
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].payload, Bytes::from_static(b"hello"));
    assert_eq!(messages[0].ppid, 51);
    assert_eq!(last_sack(&assoc).cum_tsn_ack, PEER_INITIAL_TSN);

    // Out of order: held back and reported as a gap.
    assoc.context_mut().clear();
    assoc.handle_chunk(now, peer_a(), LOCAL_TAG, peer_data(PEER_INITIAL_TSN + 2, 0, 2, b"late"));
    assert!(delivered(&assoc).is_empty());
    let sack = last_sack(&assoc);
    assert_eq!(sack.cum_tsn_ack, PEER_INITIAL_TSN);
    assert_eq!(sack.gap_blocks.len(), 1);
    assert_eq!((sack.gap_blocks[0].start, sack.gap_blocks[0].end), (2, 2));

    assoc.context_mut().clear();
    assoc.handle_chunk(now, peer_a(), LOCAL_TAG, peer_data(PEER_INITIAL_TSN + 1, 0, 1, b"mid"));
    let payloads: Vec<_> = delivered(&assoc).into_iter().map(|m| m.payload).collect();
    assert_eq!(payloads, vec![Bytes::from_static(b"mid"), Bytes::from_static(b"late")]);
    assert_eq!(last_sack(&assoc).cum_tsn_ack, PEER_INITIAL_TSN + 2);
}

#[test]
fn test_advertised_window_tracks_buffered_data() {
    let _ = env_logger::builder().is_test(true).try_init();
    let config = SctpConfig {
        receive_window: 4096,
        ..test_config()
    };
    let mut assoc = established(config);
    let now = Instant::now();
    assoc.handle_chunk(now, peer_a(), LOCAL_TAG, peer_data(PEER_INITIAL_TSN + 1, 0, 1, &[0u8; 1000]));
    assert!(delivered(&assoc).is_empty());
    assert_eq!(last_sack(&assoc).a_rwnd, 3096, "window shrinks by the held payload");

    assoc.context_mut().clear();
    assoc.handle_chunk(now, peer_a(), LOCAL_TAG, peer_data(PEER_INITIAL_TSN, 0, 0, b"x"));
    assert_eq!(delivered(&assoc).len(), 2);
    assert_eq!(last_sack(&assoc).a_rwnd, 4096, "delivery frees the window");

    let huge = SctpConfig {
        receive_window: usize::MAX,
        ..test_config()
    };
    let mut assoc = established(huge);
    assoc.handle_chunk(now, peer_a(), LOCAL_TAG, peer_data(PEER_INITIAL_TSN, 0, 0, b"x"));
    assert_eq!(last_sack(&assoc).a_rwnd, u32::MAX, "oversized window saturates");
}

#[test]
fn test_duplicate_data_is_reported() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut assoc = established(test_config());
    let now = Instant::now();
    assoc.handle_chunk(now, peer_a(), LOCAL_TAG, peer_data(PEER_INITIAL_TSN, 0, 0, b"x"));
    assoc.context_mut().clear();
    assoc.handle_chunk(now, peer_a(), LOCAL_TAG, peer_data(PEER_INITIAL_TSN, 0, 0, b"x"));
    assert!(delivered(&assoc).is_empty());
    assert_eq!(last_sack(&assoc).duplicates, vec![PEER_INITIAL_TSN]);
}

#[test]
fn test_data_for_invalid_stream() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut assoc = established(test_config());
    assoc.handle_chunk(Instant::now(), peer_a(), LOCAL_TAG, peer_data(PEER_INITIAL_TSN, 500, 0, b"x"));
    let errors: Vec<_> = sent_chunks(&assoc)
        .into_iter()
        .filter_map(|c| match c {
            Chunk::Error { causes } => Some(causes),
            _ => None,
        })
        .flatten()
        .collect();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].code, CAUSE_INVALID_STREAM);
    assert_eq!(
        last_sack(&assoc).cum_tsn_ack,
        PEER_INITIAL_TSN,
        "the TSN still counts as received"
    );
    assert_eq!(assoc.state(), AssociationState::Established);
}

#[test]
fn test_empty_data_aborts() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut assoc = established(test_config());
    assoc.handle_chunk(Instant::now(), peer_a(), LOCAL_TAG, peer_data(PEER_INITIAL_TSN, 0, 0, b""));
    assert_eq!(assoc.state(), AssociationState::Closed);
    let abort = sent_chunks(&assoc)
        .into_iter()
        .find_map(|c| match c {
            Chunk::Abort { causes, .. } => Some(causes),
            _ => None,
        })
        .expect("ABORT sent");
    assert_eq!(abort[0].code, CAUSE_NO_USER_DATA);
    assert!(indications(&assoc).contains(&Indication::ConnectionLost(
        ConnectionLossReason::ProtocolViolation
    )));
}

#[test]
fn test_verification_tag_rules() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut assoc = established(test_config());
    let now = Instant::now();

    assoc.handle_chunk(now, peer_a(), 0xdead, peer_data(PEER_INITIAL_TSN, 0, 0, b"x"));
    assert!(delivered(&assoc).is_empty(), "DATA with a foreign tag is dropped");

    assoc.handle_chunk(now, peer_a(), 7, Chunk::Init(peer_init()));
    assert!(sent_chunks(&assoc).is_empty(), "INIT needs a zero tag");

    assoc.handle_chunk(now, peer_a(), 0xdead, Chunk::Error { causes: Vec::new() });
    assoc.handle_chunk(
        now,
        peer_a(),
        0xdead,
        Chunk::Abort {
            reflected: false,
            causes: Vec::new(),
        },
    );
    assert_eq!(assoc.state(), AssociationState::Established, "ABORT needs our tag");

    // A reflected ABORT carries the peer's own tag.
    assoc.handle_chunk(
        now,
        peer_a(),
        PEER_TAG,
        Chunk::Abort {
            reflected: true,
            causes: Vec::new(),
        },
    );
    assert_eq!(assoc.state(), AssociationState::Closed);
    assert!(indications(&assoc).contains(&Indication::ConnectionLost(
        ConnectionLossReason::PeerAbort
    )));
    assert!(
        !sent_chunks(&assoc).iter().any(|c| matches!(c, Chunk::Abort { .. })),
        "an ABORT is never answered"
    );
}

#[test]
fn test_user_abort() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut assoc = established(test_config());
    assoc.abort(Instant::now());
    assert_eq!(assoc.state(), AssociationState::Closed);
    let actions = sent_chunks(&assoc);
    let Some(Chunk::Abort { causes, .. }) = actions.first() else {
        panic!("expected ABORT, got {:?}", actions);
    };
    assert_eq!(causes[0].code, CAUSE_USER_INITIATED_ABORT);
    assert_eq!(
        assoc.verification_tag_for(&actions[0]),
        PEER_TAG,
        "our ABORT carries the peer tag"
    );
}

#[test]
fn test_graceful_shutdown_initiated_locally() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut assoc = established(test_config());
    let now = Instant::now();
    assoc.send(now, OutgoingMessage::new(0, b"bye".to_vec())).unwrap();
    assoc.shutdown(now).unwrap();
    assert_eq!(assoc.state(), AssociationState::ShutdownPending, "data still outstanding");

    assoc.context_mut().clear();
    assoc.handle_chunk(now, peer_a(), LOCAL_TAG, sack(1, &[]));
    assert_eq!(assoc.state(), AssociationState::ShutdownSent);
    assert!(sent_chunks(&assoc).contains(&Chunk::Shutdown {
        cum_tsn_ack: PEER_INITIAL_TSN - 1
    }));
    assert!(assoc.send(now, OutgoingMessage::new(0, b"more".to_vec())).is_err());

    assoc.context_mut().clear();
    assoc.handle_chunk(now, peer_a(), LOCAL_TAG, Chunk::ShutdownAck);
    assert_eq!(assoc.state(), AssociationState::Closed);
    assert!(sent_chunks(&assoc).contains(&Chunk::ShutdownComplete { reflected: false }));
    assert!(indications(&assoc).contains(&Indication::Closed));
}

#[test]
fn test_graceful_shutdown_initiated_by_peer() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut assoc = established(test_config());
    let now = Instant::now();
    assoc.handle_chunk(
        now,
        peer_a(),
        LOCAL_TAG,
        Chunk::Shutdown {
            cum_tsn_ack: LOCAL_INITIAL_TSN - 1,
        },
    );
    assert_eq!(assoc.state(), AssociationState::ShutdownAckSent);
    assert!(indications(&assoc).contains(&Indication::ShutdownReceived));
    assert!(sent_chunks(&assoc).contains(&Chunk::ShutdownAck));

    assoc.handle_chunk(now, peer_a(), LOCAL_TAG, Chunk::ShutdownComplete { reflected: false });
    assert_eq!(assoc.state(), AssociationState::Closed);
}

#[test]
fn test_shutdown_ack_out_of_the_blue() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut assoc = closed(test_config());
    assoc.handle_chunk(Instant::now(), peer_a(), PEER_TAG, Chunk::ShutdownAck);
    assert_eq!(
        sent_chunks(&assoc),
        vec![Chunk::ShutdownComplete { reflected: true }]
    );
}

#[test]
fn test_heartbeat_is_echoed() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut assoc = established(test_config());
    let info = Bytes::from_static(b"probe");
    assoc.handle_chunk(Instant::now(), peer_a(), LOCAL_TAG, Chunk::Heartbeat { info: info.clone() });
    assert_eq!(sent_chunks(&assoc), vec![Chunk::HeartbeatAck { info }]);
}

#[test]
fn test_asconf_adds_and_refuses_paths() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut assoc = established(test_config());
    let now = Instant::now();
    let add = Asconf {
        serial: PEER_INITIAL_TSN,
        address: None,
        params: vec![
            AsconfParam {
                correlation_id: 1,
                request: AsconfRequest::AddIp(peer_b().ip()),
            },
            AsconfParam {
                correlation_id: 2,
                request: AsconfRequest::DeleteIp(peer_a().ip()),
            },
        ],
    };
    assoc.handle_chunk(now, peer_a(), LOCAL_TAG, Chunk::Asconf(add.clone()));
    assert!(assoc.path(peer_b()).is_some());
    assert!(indications(&assoc).contains(&Indication::AddressAdded(peer_b())));
    let ack = sent_chunks(&assoc)
        .into_iter()
        .find_map(|c| match c {
            Chunk::AsconfAck(ack) => Some(ack),
            _ => None,
        })
        .expect("ASCONF-ACK sent");
    assert_eq!(ack.serial, PEER_INITIAL_TSN);
    assert_eq!(ack.failures.len(), 1);
    assert_eq!(ack.failures[0].0, 2);
    assert_eq!(ack.failures[0].1.code, CAUSE_DELETE_SOURCE_ADDRESS);

    // A retransmitted ASCONF is answered with the same ack.
    assoc.context_mut().clear();
    assoc.handle_chunk(now, peer_a(), LOCAL_TAG, Chunk::Asconf(add));
    assert_eq!(sent_chunks(&assoc), vec![Chunk::AsconfAck(ack)]);
    assert_eq!(assoc.paths().len(), 2);
}

#[test]
fn test_raw_packet_round_trip() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut assoc = established(test_config());
    let config = assoc.config().clone();
    let mut packet = Packet::new(config.remote_port, config.local_port, LOCAL_TAG);
    packet.chunks.push(peer_data(PEER_INITIAL_TSN, 1, 0, b"wire"));
    assoc
        .receive_raw(Instant::now(), peer_a(), packet.marshal())
        .unwrap();
    assert_eq!(delivered(&assoc)[0].payload, Bytes::from_static(b"wire"));

    let mut corrupted = packet.marshal().to_vec();
    corrupted[8] ^= 0xff;
    assert!(
        assoc
            .receive_raw(Instant::now(), peer_a(), Bytes::from(corrupted))
            .is_err(),
        "checksum mismatch is reported"
    );
}
