//! The association state machine.
//!
//! An [`Association`] is driven entirely from the outside: inbound packets via
//! [`Association::handle_packet`], timer expiries via
//! [`Association::handle_timeout`] and user calls such as
//! [`Association::send`]. Every effect goes out through the
//! [`AssociationContext`].

mod asconf;
mod handshake;
mod receive;
mod reconfig;
pub(crate) mod sack;
mod shutdown;
mod timeout;
mod transmit;

use crate::chunk::packet::Packet;
use crate::chunk::{CAUSE_USER_INITIATED_ABORT, Chunk, ErrorCause, PacketDrop};
use crate::config::SctpConfig;
use crate::congestion::{CongestionController, NewReno};
use crate::context::{AssociationContext, ConnectionLossReason, Indication};
use crate::error::{SctpError, SctpResult};
use crate::gap_list::GapList;
use crate::path::{Path, PathId, PathSet};
use crate::queue::OutboundQueues;
use crate::stream::{OutgoingMessage, StreamEngine};
use crate::timer::{TimerId, Timers};
use asconf::AsconfState;
use bytes::Bytes;
use reconfig::ReconfigState;
use std::net::SocketAddr;
use std::time::Instant;
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssociationState {
    /// No association exists. Also the listening state: INIT is answered
    /// statelessly until a valid COOKIE ECHO arrives.
    Closed,
    CookieWait,
    CookieEchoed,
    Established,
    ShutdownPending,
    ShutdownSent,
    ShutdownReceived,
    ShutdownAckSent,
}

impl AssociationState {
    /// States in which DATA may be sent and acknowledged.
    fn carries_data(self) -> bool {
        matches!(
            self,
            Self::Established | Self::ShutdownPending | Self::ShutdownReceived
        )
    }
}

/// Per-packet facts collected while dispatching chunks.
#[derive(Debug)]
pub(crate) struct Inbound {
    source: SocketAddr,
    path: Option<PathId>,
    data_received: bool,
    duplicate: bool,
    immediate_sack: bool,
    transmit: bool,
    stop: bool,
}

impl Inbound {
    fn new(source: SocketAddr, path: Option<PathId>) -> Self {
        Self {
            source,
            path,
            data_received: false,
            duplicate: false,
            immediate_sack: false,
            transmit: false,
            stop: false,
        }
    }
}

pub struct Association<C: AssociationContext> {
    config: SctpConfig,
    ctx: C,
    state: AssociationState,
    local_tag: u32,
    peer_tag: u32,
    cookie_secret: u32,
    paths: PathSet,
    cc: Box<dyn CongestionController>,
    timers: Timers,
    queues: OutboundQueues,
    streams: StreamEngine,

    // Sender
    initial_tsn: u32,
    next_tsn: u32,
    last_tsn_ack: u32,
    highest_tsn_acked: u32,
    advanced_peer_ack_point: u32,
    peer_rwnd: u32,
    initial_peer_rwnd: u32,
    last_sack_sequence: Option<u32>,
    error_count: u32,

    // Receiver
    received: GapList,
    duplicates: Vec<u32>,
    packets_since_sack: u32,
    sack_sequence: u32,
    last_data_path: Option<PathId>,
    pending_drop_report: Option<PacketDrop>,

    // Handshake, shutdown, liveness
    init_retransmits: u32,
    handshake_chunk: Option<Chunk>,
    shutdown_path: Option<PathId>,
    heartbeat_nonce: u64,

    reconfig: ReconfigState,
    asconf: AsconfState,
}

impl<C: AssociationContext> Association<C> {
    pub fn new(config: SctpConfig, ctx: C) -> SctpResult<Self> {
        let local_tag = loop {
            let tag = rand::random::<u32>();
            if tag != 0 {
                break tag;
            }
        };
        Self::with_initial_values(config, ctx, local_tag, rand::random::<u32>())
    }

    /// Creates an association with a fixed verification tag and initial TSN.
    pub fn with_initial_values(
        config: SctpConfig,
        ctx: C,
        local_tag: u32,
        initial_tsn: u32,
    ) -> SctpResult<Self> {
        config.validate()?;
        let streams = StreamEngine::new(config.outbound_streams, config.inbound_streams);
        Ok(Self {
            state: AssociationState::Closed,
            local_tag,
            peer_tag: 0,
            cookie_secret: rand::random::<u32>(),
            paths: PathSet::default(),
            cc: Box::new(NewReno),
            timers: Timers::default(),
            queues: OutboundQueues::default(),
            streams,
            initial_tsn,
            next_tsn: initial_tsn,
            last_tsn_ack: initial_tsn.wrapping_sub(1),
            highest_tsn_acked: initial_tsn.wrapping_sub(1),
            advanced_peer_ack_point: initial_tsn.wrapping_sub(1),
            peer_rwnd: 0,
            initial_peer_rwnd: 0,
            last_sack_sequence: None,
            error_count: 0,
            received: GapList::new(0),
            duplicates: Vec::new(),
            packets_since_sack: 0,
            sack_sequence: 0,
            last_data_path: None,
            pending_drop_report: None,
            init_retransmits: 0,
            handshake_chunk: None,
            shutdown_path: None,
            heartbeat_nonce: 0,
            reconfig: ReconfigState::new(initial_tsn),
            asconf: AsconfState::default(),
            config,
            ctx,
        })
    }

    pub fn with_congestion_controller(mut self, cc: Box<dyn CongestionController>) -> Self {
        self.cc = cc;
        self
    }

    pub fn state(&self) -> AssociationState {
        self.state
    }

    pub fn config(&self) -> &SctpConfig {
        &self.config
    }

    pub fn local_tag(&self) -> u32 {
        self.local_tag
    }

    pub fn peer_tag(&self) -> u32 {
        self.peer_tag
    }

    pub fn context(&self) -> &C {
        &self.ctx
    }

    pub fn context_mut(&mut self) -> &mut C {
        &mut self.ctx
    }

    pub fn paths(&self) -> &PathSet {
        &self.paths
    }

    pub fn path(&self, remote: SocketAddr) -> Option<&Path> {
        self.paths.find(remote).and_then(|id| self.paths.get(id))
    }

    pub fn primary_path(&self) -> Option<&Path> {
        self.paths.primary().and_then(|id| self.paths.get(id))
    }

    pub fn queues(&self) -> &OutboundQueues {
        &self.queues
    }

    pub fn streams(&self) -> &StreamEngine {
        &self.streams
    }

    pub fn received(&self) -> &GapList {
        &self.received
    }

    pub fn next_tsn(&self) -> u32 {
        self.next_tsn
    }

    /// Cumulative TSN ack last reported by the peer.
    pub fn peer_cum_tsn_ack(&self) -> u32 {
        self.last_tsn_ack
    }

    pub fn highest_tsn_acked(&self) -> u32 {
        self.highest_tsn_acked
    }

    pub fn peer_rwnd(&self) -> u32 {
        self.peer_rwnd
    }

    pub fn error_count(&self) -> u32 {
        self.error_count
    }

    pub fn outstanding_bytes(&self) -> usize {
        self.paths.iter().map(|p| p.outstanding_bytes).sum()
    }

    /// Bytes accepted from the user and not yet acknowledged.
    pub fn buffered_amount(&self) -> usize {
        self.streams.queued_bytes() + self.queues.total_bytes()
    }

    /// Verification tag for the packet carrying `chunk`.
    pub fn verification_tag_for(&self, chunk: &Chunk) -> u32 {
        match chunk {
            Chunk::Init(_) => 0,
            Chunk::Abort { reflected: true, .. } | Chunk::ShutdownComplete { reflected: true } => {
                self.local_tag
            }
            _ => self.peer_tag,
        }
    }

    fn set_state(&mut self, new_state: AssociationState) {
        if self.state != new_state {
            debug!("SCTP state transition: {:?} -> {:?}", self.state, new_state);
            self.state = new_state;
        }
    }

    /// Decodes and processes a raw packet.
    pub fn receive_raw(&mut self, now: Instant, source: SocketAddr, raw: Bytes) -> anyhow::Result<()> {
        let packet = Packet::unmarshal(raw)?;
        if packet.destination_port != self.config.local_port {
            debug!(
                "Dropping packet for port {} (local port {})",
                packet.destination_port, self.config.local_port
            );
            return Ok(());
        }
        self.handle_packet(now, source, packet);
        Ok(())
    }

    pub fn handle_packet(&mut self, now: Instant, source: SocketAddr, packet: Packet) {
        self.process_chunks(now, source, packet.verification_tag, packet.chunks);
    }

    /// Processes a single chunk as if it arrived alone in a packet.
    pub fn handle_chunk(&mut self, now: Instant, source: SocketAddr, verification_tag: u32, chunk: Chunk) {
        self.process_chunks(now, source, verification_tag, vec![chunk]);
    }

    fn process_chunks(&mut self, now: Instant, source: SocketAddr, vtag: u32, chunks: Vec<Chunk>) {
        let mut inbound = Inbound::new(source, self.paths.find(source));
        for chunk in chunks {
            let kind = chunk.chunk_type();
            if !self.accepts_tag(&chunk, vtag) {
                debug!(
                    "Discarding {:?} chunk with verification tag {:08x} (expected {:08x})",
                    kind, vtag, self.local_tag
                );
                continue;
            }
            let was_open = self.state != AssociationState::Closed;
            if let Err(e) = self.dispatch(now, &mut inbound, chunk) {
                debug!("Discarding {:?} chunk: {}", kind, e);
            }
            if inbound.stop || (was_open && self.state == AssociationState::Closed) {
                break;
            }
        }
        self.after_packet(now, &mut inbound);
    }

    fn accepts_tag(&self, chunk: &Chunk, vtag: u32) -> bool {
        match chunk {
            Chunk::Init(_) => vtag == 0,
            Chunk::Abort { reflected, .. } => {
                vtag == self.local_tag || (*reflected && vtag == self.peer_tag && self.peer_tag != 0)
            }
            Chunk::Error { .. } => true,
            Chunk::ShutdownComplete { reflected: true } => vtag == self.peer_tag,
            Chunk::ShutdownAck if self.state == AssociationState::Closed => true,
            _ => vtag == self.local_tag,
        }
    }

    fn dispatch(&mut self, now: Instant, inbound: &mut Inbound, chunk: Chunk) -> SctpResult<()> {
        use AssociationState::*;
        match chunk {
            Chunk::Init(init) => self.on_init(inbound, init),
            Chunk::InitAck(init) => self.on_init_ack(now, inbound, init),
            Chunk::CookieEcho { cookie } => self.on_cookie_echo(now, inbound, cookie),
            Chunk::CookieAck => self.on_cookie_ack(now),
            Chunk::Data(data) => self.on_data(now, inbound, data),
            Chunk::Sack(sack) => {
                if matches!(self.state, Established | ShutdownPending | ShutdownSent | ShutdownReceived) {
                    self.on_sack(now, inbound, sack)
                } else {
                    trace!("Ignoring SACK in state {:?}", self.state);
                    Ok(())
                }
            }
            Chunk::Heartbeat { info } => {
                if self.state != Closed {
                    self.ctx.send(Chunk::HeartbeatAck { info }, inbound.source);
                }
                Ok(())
            }
            Chunk::HeartbeatAck { info } => {
                if self.state != Closed {
                    self.on_heartbeat_ack(now, info)?;
                }
                Ok(())
            }
            Chunk::Abort { causes, .. } => {
                debug!("SCTP ABORT received from remote peer: {:?}", causes);
                if self.state != Closed {
                    self.connection_lost(ConnectionLossReason::PeerAbort);
                }
                inbound.stop = true;
                Ok(())
            }
            Chunk::Error { causes } => {
                debug!("SCTP ERROR received: {:?}", causes);
                Ok(())
            }
            Chunk::Shutdown { cum_tsn_ack } => self.on_shutdown(now, inbound, cum_tsn_ack),
            Chunk::ShutdownAck => self.on_shutdown_ack(inbound),
            Chunk::ShutdownComplete { .. } => self.on_shutdown_complete(),
            Chunk::ForwardTsn(fwd) => {
                if matches!(self.state, Established | ShutdownPending | ShutdownSent) {
                    self.on_forward_tsn(now, inbound, fwd);
                }
                Ok(())
            }
            Chunk::ReConfig { params } => {
                if self.state == Established {
                    self.on_reconfig(now, inbound, params);
                } else {
                    trace!("Ignoring RE-CONFIG in state {:?}", self.state);
                }
                Ok(())
            }
            Chunk::Asconf(asconf) => {
                if self.state == Established {
                    self.on_asconf(now, inbound, asconf);
                }
                Ok(())
            }
            Chunk::AsconfAck(ack) => {
                trace!("Ignoring ASCONF-ACK for serial {}", ack.serial);
                Ok(())
            }
            Chunk::PacketDrop(drop) => {
                if self.state.carries_data() {
                    self.on_packet_drop(inbound, drop);
                }
                Ok(())
            }
        }
    }

    fn after_packet(&mut self, now: Instant, inbound: &mut Inbound) {
        if self.state == AssociationState::Closed {
            return;
        }
        if let Some(report) = self.pending_drop_report.take() {
            self.ctx.send(Chunk::PacketDrop(report), inbound.source);
        }
        if inbound.data_received {
            self.packets_since_sack += 1;
            let immediate = inbound.duplicate
                || inbound.immediate_sack
                || self.received.has_gaps()
                || self.packets_since_sack >= self.config.sack_frequency
                || self.config.sack_delay.is_zero()
                || !matches!(self.state, AssociationState::Established);
            if immediate {
                self.send_sack();
            } else if !self.timers.is_running(TimerId::DelayedSack) {
                self.timers
                    .start(&mut self.ctx, TimerId::DelayedSack, self.config.sack_delay);
            }
        }
        if inbound.transmit {
            self.transmit(now);
        }
    }

    /// Queues a user message and transmits what the windows allow.
    pub fn send(&mut self, now: Instant, message: OutgoingMessage) -> SctpResult<()> {
        use AssociationState::*;
        if !matches!(self.state, Established | CookieWait | CookieEchoed) {
            return Err(SctpError::InvalidState(self.state));
        }
        let limit = self.config.send_queue_limit;
        let queued = self.buffered_amount();
        if limit > 0 && queued + message.payload.len() > limit {
            return Err(SctpError::SendQueueFull { queued, limit });
        }
        self.streams.enqueue(message, self.config.max_payload())?;
        if self.state == Established {
            self.transmit(now);
        }
        Ok(())
    }

    /// Sends ABORT and tears the association down.
    pub fn abort(&mut self, _now: Instant) {
        if self.state == AssociationState::Closed {
            return;
        }
        self.send_abort(vec![ErrorCause::new(CAUSE_USER_INITIATED_ABORT, Bytes::new())]);
        self.ctx
            .indicate(Indication::ConnectionLost(ConnectionLossReason::UserAbort));
        self.teardown();
    }

    /// Adds a destination address. Returns the existing id for a known
    /// address.
    pub fn add_path(&mut self, now: Instant, remote: SocketAddr) -> PathId {
        let (id, created) = self.paths.add(remote, &self.config);
        if created {
            if let Some(path) = self.paths.get_mut(id) {
                self.cc.initialize(path, self.initial_peer_rwnd.max(self.peer_rwnd));
            }
            debug!("Added {} for {}", id, remote);
            self.ctx.indicate(Indication::AddressAdded(remote));
            if self.state.carries_data() {
                self.start_heartbeat(now, id);
            }
        }
        id
    }

    pub fn remove_path(&mut self, now: Instant, remote: SocketAddr) -> SctpResult<()> {
        let id = self.paths.find(remote).ok_or(SctpError::UnknownPath(remote))?;
        if self.paths.len() <= 1 {
            return Err(SctpError::LastPath);
        }
        self.drop_path(now, id);
        Ok(())
    }

    pub fn set_primary(&mut self, remote: SocketAddr) -> SctpResult<()> {
        let id = self.paths.find(remote).ok_or(SctpError::UnknownPath(remote))?;
        if self.paths.primary() != Some(id) {
            self.paths.set_primary(id);
            debug!("Primary path set to {} ({})", id, remote);
            self.ctx.indicate(Indication::PrimaryChanged(remote));
        }
        Ok(())
    }

    /// Removes a path and moves everything bound to it to other paths.
    fn drop_path(&mut self, now: Instant, id: PathId) {
        let Some(removed) = self.paths.remove(id) else {
            return;
        };
        self.timers.stop_path(&mut self.ctx, id);
        let destination = self.paths.retransmit_destination(Some(id));
        let stranded: Vec<u32> = self
            .queues
            .all()
            .filter(|c| {
                !c.flags.acked
                    && !c.flags.abandoned
                    && (c.last_path == Some(id) || c.next_path == Some(id))
            })
            .map(|c| c.tsn)
            .collect();
        for tsn in stranded {
            let pending = self.queues.is_pending_transmission(tsn);
            if let Some(chunk) = self.queues.get_mut(tsn) {
                if chunk.flags.counts_as_outstanding {
                    chunk.flags.counts_as_outstanding = false;
                    self.peer_rwnd = self.peer_rwnd.saturating_add(chunk.len() as u32);
                }
                chunk.next_path = destination;
                if chunk.last_path == Some(id) {
                    chunk.flags.moved = true;
                }
            }
            if !pending {
                self.queues.schedule_retransmission(tsn);
            }
        }
        self.peer_rwnd = self.peer_rwnd.min(self.initial_peer_rwnd);
        if self.last_data_path == Some(id) {
            self.last_data_path = None;
        }
        debug!("Removed {} ({})", id, removed.remote);
        self.ctx.indicate(Indication::AddressRemoved(removed.remote));
        if self.paths.active_count() == 0 && self.state != AssociationState::Closed {
            self.connection_lost(ConnectionLossReason::NoActivePath);
            return;
        }
        self.transmit(now);
    }

    fn send_to_path(&mut self, id: PathId, chunk: Chunk) {
        if let Some(path) = self.paths.get(id) {
            let remote = path.remote;
            self.ctx.send(chunk, remote);
        }
    }

    fn send_to_primary(&mut self, chunk: Chunk) {
        if let Some(id) = self.paths.primary() {
            self.send_to_path(id, chunk);
        }
    }

    fn send_abort(&mut self, causes: Vec<ErrorCause>) {
        self.send_to_primary(Chunk::Abort {
            reflected: false,
            causes,
        });
    }

    /// Reports the loss and removes all association state.
    fn connection_lost(&mut self, reason: ConnectionLossReason) {
        if self.state == AssociationState::Closed {
            return;
        }
        debug!("SCTP connection lost: {:?}", reason);
        if !matches!(
            reason,
            ConnectionLossReason::PeerAbort | ConnectionLossReason::InitTimeout
        ) {
            self.send_abort(Vec::new());
        }
        self.ctx.indicate(Indication::ConnectionLost(reason));
        self.teardown();
    }

    fn teardown(&mut self) {
        self.timers.stop_all(&mut self.ctx);
        self.queues.clear();
        self.streams.clear();
        self.reconfig.clear();
        self.handshake_chunk = None;
        self.duplicates.clear();
        for path in self.paths.iter_mut() {
            path.outstanding_bytes = 0;
            path.heartbeat = None;
        }
        self.set_state(AssociationState::Closed);
    }
}
