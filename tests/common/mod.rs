#![allow(dead_code)]

use bytes::Bytes;
use rustsctp::chunk::{Data, Init, Sack};
use rustsctp::gap_list::GapBlock;
use rustsctp::{
    ActionQueue, Association, AssociationState, Chunk, Indication, Message, SctpConfig,
};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

pub const LOCAL_TAG: u32 = 0x0102_0304;
pub const PEER_TAG: u32 = 0xfeed_beef;
pub const LOCAL_INITIAL_TSN: u32 = 1;
pub const PEER_INITIAL_TSN: u32 = 5000;
pub const PEER_RWND: u32 = 1 << 20;

pub fn peer_a() -> SocketAddr {
    "10.0.0.2:5000".parse().unwrap()
}

pub fn peer_b() -> SocketAddr {
    "10.0.1.2:5000".parse().unwrap()
}

/// Config without heartbeats or delayed acks so tests see only the chunks
/// they provoke.
pub fn test_config() -> SctpConfig {
    SctpConfig {
        heartbeat_interval: None,
        sack_delay: Duration::ZERO,
        ..SctpConfig::default()
    }
}

pub fn peer_init_ack() -> Init {
    Init {
        initiate_tag: PEER_TAG,
        a_rwnd: PEER_RWND,
        outbound_streams: 16,
        inbound_streams: 16,
        initial_tsn: PEER_INITIAL_TSN,
        addresses: Vec::new(),
        forward_tsn_supported: true,
        supported_extensions: Vec::new(),
        cookie: Some(Bytes::from_static(b"opaque cookie")),
    }
}

/// An association that completed the handshake with a scripted peer at
/// [`peer_a`]. The recorded actions are cleared.
pub fn established(config: SctpConfig) -> Association<ActionQueue> {
    let assoc =
        Association::with_initial_values(config, ActionQueue::default(), LOCAL_TAG, LOCAL_INITIAL_TSN)
            .unwrap();
    handshake(assoc)
}

/// Drives a closed association through the active handshake.
pub fn handshake(mut assoc: Association<ActionQueue>) -> Association<ActionQueue> {
    let now = Instant::now();
    assoc.connect(now, peer_a()).unwrap();
    assoc.handle_chunk(now, peer_a(), LOCAL_TAG, Chunk::InitAck(peer_init_ack()));
    assert_eq!(assoc.state(), AssociationState::CookieEchoed);
    assoc.handle_chunk(now, peer_a(), LOCAL_TAG, Chunk::CookieAck);
    assert_eq!(assoc.state(), AssociationState::Established);
    assoc.context_mut().clear();
    assoc
}

/// SACK with gap blocks given as offsets from `cum`.
pub fn sack(cum: u32, gaps: &[(u16, u16)]) -> Chunk {
    Chunk::Sack(Sack {
        cum_tsn_ack: cum,
        a_rwnd: PEER_RWND,
        gap_blocks: gaps.iter().map(|(s, e)| GapBlock::new(*s, *e)).collect(),
        ..Default::default()
    })
}

pub fn peer_data(tsn: u32, stream_id: u16, stream_seq: u16, payload: &'static [u8]) -> Chunk {
    Chunk::Data(Data {
        tsn,
        stream_id,
        stream_seq,
        ppid: 51,
        unordered: false,
        beginning: true,
        ending: true,
        immediate: false,
        payload: Bytes::from_static(payload),
    })
}

pub fn sent_data(assoc: &Association<ActionQueue>) -> Vec<(Data, SocketAddr)> {
    assoc
        .context()
        .sent()
        .filter_map(|(chunk, to)| match chunk {
            Chunk::Data(data) => Some((data.clone(), to)),
            _ => None,
        })
        .collect()
}

pub fn sent_chunks(assoc: &Association<ActionQueue>) -> Vec<Chunk> {
    assoc.context().sent().map(|(chunk, _)| chunk.clone()).collect()
}

pub fn indications(assoc: &Association<ActionQueue>) -> Vec<Indication> {
    assoc.context().indications().cloned().collect()
}

pub fn delivered(assoc: &Association<ActionQueue>) -> Vec<Message> {
    assoc.context().delivered().cloned().collect()
}
