//! Four-way handshake: INIT, INIT ACK, COOKIE ECHO and COOKIE ACK.
//!
//! The passive side keeps no state until a COOKIE ECHO with a valid
//! signature arrives; everything it needs travels inside the cookie.

use super::{Association, AssociationState, Inbound};
use crate::chunk::{Chunk, Init, SUPPORTED_EXTENSIONS, decode_address, params_iter, put_address};
use crate::context::{AssociationContext, ConnectionLossReason, Indication};
use crate::error::{SctpError, SctpResult};
use crate::gap_list::GapList;
use crate::timer::TimerId;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::net::{IpAddr, SocketAddr};
use std::time::Instant;
use tracing::{debug, trace};

const COOKIE_FIXED_LEN: usize = 24;

/// What we learn about the peer from INIT, INIT ACK or a state cookie.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PeerParameters {
    tag: u32,
    initial_tsn: u32,
    a_rwnd: u32,
    outbound_streams: u16,
    inbound_streams: u16,
    addresses: Vec<IpAddr>,
}

impl From<&Init> for PeerParameters {
    fn from(init: &Init) -> Self {
        Self {
            tag: init.initiate_tag,
            initial_tsn: init.initial_tsn,
            a_rwnd: init.a_rwnd,
            outbound_streams: init.outbound_streams,
            inbound_streams: init.inbound_streams,
            addresses: init.addresses.clone(),
        }
    }
}

fn signature(secret: u32, body: &[u8]) -> u32 {
    crc32c::crc32c_append(crc32c::crc32c(&secret.to_be_bytes()), body)
}

impl<C: AssociationContext> Association<C> {
    /// Starts the handshake towards `remote`.
    pub fn connect(&mut self, _now: Instant, remote: SocketAddr) -> SctpResult<()> {
        if self.state != AssociationState::Closed {
            return Err(SctpError::InvalidState(self.state));
        }
        let (id, _) = self.paths.add(remote, &self.config);
        self.paths.set_primary(id);
        let init = Chunk::Init(self.local_init(None));
        debug!("Sending INIT to {}", remote);
        self.send_to_path(id, init.clone());
        self.handshake_chunk = Some(init);
        self.init_retransmits = 0;
        self.set_state(AssociationState::CookieWait);
        self.start_init_timer();
        Ok(())
    }

    fn local_init(&self, cookie: Option<Bytes>) -> Init {
        Init {
            initiate_tag: self.local_tag,
            a_rwnd: u32::try_from(self.config.receive_window).unwrap_or(u32::MAX),
            outbound_streams: self.config.outbound_streams,
            inbound_streams: self.config.inbound_streams,
            initial_tsn: self.initial_tsn,
            addresses: Vec::new(),
            forward_tsn_supported: true,
            supported_extensions: SUPPORTED_EXTENSIONS.to_vec(),
            cookie,
        }
    }

    fn start_init_timer(&mut self) {
        let rto = self.primary_path().map(|p| p.rto.rto()).unwrap_or(self.config.rto_initial);
        self.timers.start(&mut self.ctx, TimerId::Init, rto);
    }

    pub(crate) fn on_init(&mut self, inbound: &mut Inbound, init: Init) -> SctpResult<()> {
        if init.initiate_tag == 0 {
            return Err(SctpError::MalformedChunk("INIT with zero initiate tag"));
        }
        match self.state {
            AssociationState::Closed
            | AssociationState::CookieWait
            | AssociationState::CookieEchoed => {
                // INIT ACK is addressed with the peer's initiate tag.
                self.peer_tag = init.initiate_tag;
                let cookie = self.make_cookie(&PeerParameters::from(&init));
                debug!("Answering INIT from {} in state {:?}", inbound.source, self.state);
                self.ctx
                    .send(Chunk::InitAck(self.local_init(Some(cookie))), inbound.source);
            }
            state => debug!("Ignoring INIT in state {:?}", state),
        }
        Ok(())
    }

    pub(crate) fn on_init_ack(&mut self, now: Instant, inbound: &mut Inbound, init_ack: Init) -> SctpResult<()> {
        if self.state != AssociationState::CookieWait {
            trace!("Ignoring INIT ACK in state {:?}", self.state);
            return Ok(());
        }
        let cookie = init_ack
            .cookie
            .clone()
            .ok_or(SctpError::MalformedChunk("INIT ACK without state cookie"))?;
        if init_ack.initiate_tag == 0 {
            return Err(SctpError::MalformedChunk("INIT ACK with zero initiate tag"));
        }
        self.timers.stop(&mut self.ctx, TimerId::Init);
        self.adopt_peer(now, &PeerParameters::from(&init_ack), inbound.source);
        let echo = Chunk::CookieEcho { cookie };
        self.ctx.send(echo.clone(), inbound.source);
        self.handshake_chunk = Some(echo);
        self.init_retransmits = 0;
        self.set_state(AssociationState::CookieEchoed);
        self.start_init_timer();
        Ok(())
    }

    pub(crate) fn on_cookie_echo(&mut self, now: Instant, inbound: &mut Inbound, cookie: Bytes) -> SctpResult<()> {
        let peer = self
            .open_cookie(cookie)
            .ok_or(SctpError::MalformedChunk("COOKIE ECHO with invalid signature"))?;
        match self.state {
            AssociationState::Closed
            | AssociationState::CookieWait
            | AssociationState::CookieEchoed => {
                self.timers.stop(&mut self.ctx, TimerId::Init);
                self.adopt_peer(now, &peer, inbound.source);
                self.ctx.send(Chunk::CookieAck, inbound.source);
                self.enter_established(now);
            }
            AssociationState::Established if peer.tag == self.peer_tag => {
                // Our COOKIE ACK was lost.
                self.ctx.send(Chunk::CookieAck, inbound.source);
            }
            state => debug!("Ignoring COOKIE ECHO in state {:?}", state),
        }
        Ok(())
    }

    pub(crate) fn on_cookie_ack(&mut self, now: Instant) -> SctpResult<()> {
        if self.state == AssociationState::CookieEchoed {
            self.timers.stop(&mut self.ctx, TimerId::Init);
            self.enter_established(now);
        }
        Ok(())
    }

    pub(crate) fn on_init_timeout(&mut self) {
        if !matches!(
            self.state,
            AssociationState::CookieWait | AssociationState::CookieEchoed
        ) {
            return;
        }
        self.init_retransmits += 1;
        if self.init_retransmits > self.config.max_init_retransmits {
            debug!("Giving up after {} INIT retransmissions", self.init_retransmits - 1);
            self.connection_lost(ConnectionLossReason::InitTimeout);
            return;
        }
        if let Some(id) = self.paths.primary() {
            if let Some(path) = self.paths.get_mut(id) {
                path.rto.backoff();
            }
            if let Some(chunk) = self.handshake_chunk.clone() {
                debug!("Retransmitting {:?} (attempt {})", chunk.chunk_type(), self.init_retransmits);
                self.send_to_path(id, chunk);
            }
        }
        self.start_init_timer();
    }

    fn enter_established(&mut self, now: Instant) {
        self.handshake_chunk = None;
        self.set_state(AssociationState::Established);
        self.ctx.indicate(Indication::CommunicationUp);
        self.start_heartbeats(now);
        self.transmit(now);
    }

    /// Installs everything learned about the peer.
    fn adopt_peer(&mut self, _now: Instant, peer: &PeerParameters, source: SocketAddr) {
        self.peer_tag = peer.tag;
        self.received = GapList::new(peer.initial_tsn.wrapping_sub(1));
        self.peer_rwnd = peer.a_rwnd;
        self.initial_peer_rwnd = peer.a_rwnd;
        self.streams.resize(
            self.config.outbound_streams.min(peer.inbound_streams),
            self.config.inbound_streams.min(peer.outbound_streams),
        );
        self.reconfig.set_peer_initial_sn(peer.initial_tsn);
        self.asconf.reset(peer.initial_tsn);

        let (source_id, _) = self.paths.add(source, &self.config);
        if self.paths.primary().is_none() {
            self.paths.set_primary(source_id);
        }
        if let Some(path) = self.paths.get_mut(source_id) {
            path.confirmed = true;
        }
        for addr in &peer.addresses {
            let remote = SocketAddr::new(*addr, source.port());
            if self.paths.add(remote, &self.config).1 {
                self.ctx.indicate(Indication::AddressAdded(remote));
            }
        }
        for path in self.paths.iter_mut() {
            self.cc.initialize(path, peer.a_rwnd);
        }
        debug!(
            "Peer tag {:08x}, initial TSN {}, rwnd {}, streams {}/{}",
            peer.tag,
            peer.initial_tsn,
            peer.a_rwnd,
            self.streams.outbound_count(),
            self.streams.inbound_count()
        );
    }

    fn make_cookie(&self, peer: &PeerParameters) -> Bytes {
        let mut buf = BytesMut::with_capacity(COOKIE_FIXED_LEN + 4);
        buf.put_u32(peer.tag);
        buf.put_u32(peer.initial_tsn);
        buf.put_u32(peer.a_rwnd);
        buf.put_u16(peer.outbound_streams);
        buf.put_u16(peer.inbound_streams);
        buf.put_u32(self.local_tag);
        buf.put_u32(self.initial_tsn);
        for addr in &peer.addresses {
            put_address(&mut buf, *addr);
        }
        let mac = signature(self.cookie_secret, &buf);
        buf.put_u32(mac);
        buf.freeze()
    }

    fn open_cookie(&self, mut cookie: Bytes) -> Option<PeerParameters> {
        if cookie.len() < COOKIE_FIXED_LEN + 4 {
            return None;
        }
        let mut mac = cookie.split_off(cookie.len() - 4);
        if mac.get_u32() != signature(self.cookie_secret, &cookie) {
            return None;
        }
        let mut peer = PeerParameters {
            tag: cookie.get_u32(),
            initial_tsn: cookie.get_u32(),
            a_rwnd: cookie.get_u32(),
            outbound_streams: cookie.get_u16(),
            inbound_streams: cookie.get_u16(),
            addresses: Vec::new(),
        };
        let (local_tag, initial_tsn) = (cookie.get_u32(), cookie.get_u32());
        if local_tag != self.local_tag || initial_tsn != self.initial_tsn {
            return None;
        }
        for (kind, value) in params_iter(cookie).ok()? {
            peer.addresses.extend(decode_address(kind, value));
        }
        Some(peer)
    }
}
