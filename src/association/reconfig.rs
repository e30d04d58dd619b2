//! Stream reconfiguration (RFC 6525): outgoing and incoming SSN resets and
//! adding streams, on both the requesting and the responding side.

use super::{Association, AssociationState, Inbound};
use crate::chunk::{Chunk, ReconfigParam, ReconfigResult};
use crate::context::{AssociationContext, ConnectionLossReason, Indication, ResetDirection};
use crate::error::{SctpError, SctpResult};
use crate::gap_list::GapList;
use crate::timer::TimerId;
use crate::tsn::tsn_gt;
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::{debug, trace};

/// Peer requests whose results are kept for answering retransmissions.
const REMEMBERED_PEER_REQUESTS: usize = 32;

/// Distance both TSN spaces move on an SSN/TSN reset (RFC 6525 §6.2.4).
const TSN_RESET_JUMP: u32 = 1 << 31;

#[derive(Debug, Clone, PartialEq, Eq)]
enum LocalRequest {
    /// Reset our outgoing streams. `answers` is set when we reset on behalf
    /// of a peer incoming request; the reset is then already applied.
    Outgoing { streams: Vec<u16>, answers: Option<u32> },
    Incoming { streams: Vec<u16> },
    AddOutgoing(u16),
    AddIncoming(u16),
}

#[derive(Debug, Clone)]
struct TrackedRequest {
    request_sn: u32,
    request: LocalRequest,
    /// Set once the request went out.
    param: Option<ReconfigParam>,
    done: bool,
}

#[derive(Debug, Clone, Copy)]
struct PeerRecord {
    param_type: u16,
    result: ReconfigResult,
    next_tsns: Option<(u32, u32)>,
}

/// A peer outgoing reset waiting for its data to arrive.
#[derive(Debug, Clone)]
struct DeferredPeerOutgoing {
    request_sn: u32,
    last_tsn: u32,
    streams: Vec<u16>,
}

/// A peer incoming reset waiting for our data on those streams to be
/// acknowledged.
#[derive(Debug, Clone)]
struct DeferredPeerIncoming {
    request_sn: u32,
    streams: Vec<u16>,
}

#[derive(Debug)]
pub(crate) struct ReconfigState {
    next_request_sn: u32,
    outstanding: Vec<TrackedRequest>,
    expected_peer_sn: u32,
    peer_results: BTreeMap<u32, PeerRecord>,
    deferred_outgoing: Option<DeferredPeerOutgoing>,
    deferred_incoming: Option<DeferredPeerIncoming>,
    /// Request sequence number of a peer SSN/TSN reset waiting for our
    /// outstanding data.
    deferred_tsn_reset: Option<u32>,
}

impl ReconfigState {
    pub(crate) fn new(initial_tsn: u32) -> Self {
        Self {
            next_request_sn: initial_tsn,
            outstanding: Vec::new(),
            expected_peer_sn: 0,
            peer_results: BTreeMap::new(),
            deferred_outgoing: None,
            deferred_incoming: None,
            deferred_tsn_reset: None,
        }
    }

    pub(crate) fn set_peer_initial_sn(&mut self, sn: u32) {
        self.expected_peer_sn = sn;
    }

    pub(crate) fn clear(&mut self) {
        self.outstanding.clear();
        self.deferred_outgoing = None;
        self.deferred_incoming = None;
        self.deferred_tsn_reset = None;
    }

    /// New data waits while a peer SSN/TSN reset is pending.
    pub(crate) fn holds_new_data(&self) -> bool {
        self.deferred_tsn_reset.is_some()
    }

    fn in_progress(&self) -> Option<u32> {
        self.outstanding.first().map(|r| r.request_sn)
    }

    fn remember(
        &mut self,
        request_sn: u32,
        param_type: u16,
        result: ReconfigResult,
        next_tsns: Option<(u32, u32)>,
    ) {
        self.peer_results.insert(
            request_sn,
            PeerRecord {
                param_type,
                result,
                next_tsns,
            },
        );
        while self.peer_results.len() > REMEMBERED_PEER_REQUESTS {
            let expected = self.expected_peer_sn;
            let Some(oldest) = self
                .peer_results
                .keys()
                .copied()
                .max_by_key(|sn| expected.wrapping_sub(*sn))
            else {
                break;
            };
            self.peer_results.remove(&oldest);
        }
    }

    fn update_result(&mut self, request_sn: u32, result: ReconfigResult, next_tsns: Option<(u32, u32)>) {
        if let Some(record) = self.peer_results.get_mut(&request_sn) {
            record.result = result;
            record.next_tsns = next_tsns;
        }
    }
}

impl<C: AssociationContext> Association<C> {
    /// Resets the given outgoing streams (all streams if empty). Returns the
    /// request sequence number.
    pub fn reset_streams(&mut self, _now: Instant, streams: &[u16]) -> SctpResult<u32> {
        self.check_reconfig_allowed(streams, self.streams.outbound_count())?;
        let sns = self.queue_requests(vec![LocalRequest::Outgoing {
            streams: streams.to_vec(),
            answers: None,
        }]);
        Ok(sns[0])
    }

    /// Asks the peer to reset its outgoing streams towards us.
    pub fn request_incoming_reset(&mut self, _now: Instant, streams: &[u16]) -> SctpResult<u32> {
        self.check_reconfig_allowed(streams, self.streams.inbound_count())?;
        let sns = self.queue_requests(vec![LocalRequest::Incoming {
            streams: streams.to_vec(),
        }]);
        Ok(sns[0])
    }

    /// Resets both directions of the given streams with one RE-CONFIG chunk.
    /// Returns the outgoing and incoming request sequence numbers.
    pub fn reset_streams_both(&mut self, _now: Instant, streams: &[u16]) -> SctpResult<(u32, u32)> {
        let limit = self.streams.outbound_count().min(self.streams.inbound_count());
        self.check_reconfig_allowed(streams, limit)?;
        let sns = self.queue_requests(vec![
            LocalRequest::Outgoing {
                streams: streams.to_vec(),
                answers: None,
            },
            LocalRequest::Incoming {
                streams: streams.to_vec(),
            },
        ]);
        Ok((sns[0], sns[1]))
    }

    /// Adds outgoing and/or incoming streams.
    pub fn add_streams(&mut self, _now: Instant, outbound: u16, inbound: u16) -> SctpResult<Vec<u32>> {
        self.check_reconfig_allowed(&[], u16::MAX)?;
        if self.streams.outbound_count() as u32 + outbound as u32 > u16::MAX as u32
            || self.streams.inbound_count() as u32 + inbound as u32 > u16::MAX as u32
        {
            return Err(SctpError::TooManyStreams);
        }
        let mut requests = Vec::new();
        if outbound > 0 {
            requests.push(LocalRequest::AddOutgoing(outbound));
        }
        if inbound > 0 {
            requests.push(LocalRequest::AddIncoming(inbound));
        }
        if requests.is_empty() {
            return Ok(Vec::new());
        }
        Ok(self.queue_requests(requests))
    }

    fn check_reconfig_allowed(&self, streams: &[u16], limit: u16) -> SctpResult<()> {
        if self.state != AssociationState::Established {
            return Err(SctpError::InvalidState(self.state));
        }
        if let Some(sn) = self.reconfig.in_progress() {
            return Err(SctpError::ResetInProgress(sn));
        }
        if let Some(sid) = streams.iter().find(|sid| **sid >= limit) {
            return Err(SctpError::InvalidStream(*sid));
        }
        Ok(())
    }

    fn queue_requests(&mut self, requests: Vec<LocalRequest>) -> Vec<u32> {
        let mut sns = Vec::with_capacity(requests.len());
        for request in requests {
            let request_sn = self.reconfig.next_request_sn;
            self.reconfig.next_request_sn = request_sn.wrapping_add(1);
            if let LocalRequest::Outgoing { streams, answers: None } = &request {
                let all = self.streams.all_outbound_if_empty(streams);
                self.streams.set_reset_pending(&all, true);
            }
            self.reconfig.outstanding.push(TrackedRequest {
                request_sn,
                request,
                param: None,
                done: false,
            });
            sns.push(request_sn);
        }
        self.send_outstanding_requests();
        sns
    }

    /// Sends queued requests once no message on a stream being reset is
    /// half sent.
    pub(crate) fn send_outstanding_requests(&mut self) {
        let outstanding = &self.reconfig.outstanding;
        if outstanding.is_empty() || outstanding.iter().any(|r| r.param.is_some()) {
            return;
        }
        let blocked = outstanding.iter().any(|r| match &r.request {
            LocalRequest::Outgoing { streams, answers: None } => self
                .streams
                .all_outbound_if_empty(streams)
                .iter()
                .any(|sid| self.streams.fragment_in_progress(*sid)),
            _ => false,
        });
        if blocked {
            trace!("Holding RE-CONFIG until partially sent messages complete");
            return;
        }
        let last_tsn = self.next_tsn.wrapping_sub(1);
        let default_response_sn = self.reconfig.expected_peer_sn.wrapping_sub(1);
        for tracked in &mut self.reconfig.outstanding {
            let request_sn = tracked.request_sn;
            tracked.param = Some(match &tracked.request {
                LocalRequest::Outgoing { streams, answers } => ReconfigParam::OutgoingReset {
                    request_sn,
                    response_sn: answers.unwrap_or(default_response_sn),
                    last_tsn,
                    streams: streams.clone(),
                },
                LocalRequest::Incoming { streams } => ReconfigParam::IncomingReset {
                    request_sn,
                    streams: streams.clone(),
                },
                LocalRequest::AddOutgoing(count) => ReconfigParam::AddOutgoingStreams {
                    request_sn,
                    count: *count,
                },
                LocalRequest::AddIncoming(count) => ReconfigParam::AddIncomingStreams {
                    request_sn,
                    count: *count,
                },
            });
        }
        self.send_reconfig_requests();
    }

    fn send_reconfig_requests(&mut self) {
        let params: Vec<ReconfigParam> = self
            .reconfig
            .outstanding
            .iter()
            .filter(|r| !r.done)
            .filter_map(|r| r.param.clone())
            .collect();
        if params.is_empty() {
            return;
        }
        debug!("Sending RE-CONFIG with {} request(s)", params.len());
        self.send_to_primary(Chunk::ReConfig { params });
        let rto = self
            .primary_path()
            .map(|p| p.rto.rto())
            .unwrap_or(self.config.rto_initial);
        self.timers.start(&mut self.ctx, TimerId::StreamReset, rto);
    }

    pub(crate) fn on_reset_timeout(&mut self) {
        if self.reconfig.outstanding.is_empty() || self.state != AssociationState::Established {
            return;
        }
        self.error_count += 1;
        if self.error_count > self.config.max_association_retransmits {
            self.connection_lost(ConnectionLossReason::RetransmissionLimit);
            return;
        }
        if let Some(path) = self.paths.primary().and_then(|id| self.paths.get_mut(id)) {
            path.rto.backoff();
        }
        debug!("Stream reset timer expired, resending request(s)");
        self.send_reconfig_requests();
    }

    pub(crate) fn on_reconfig(&mut self, now: Instant, inbound: &mut Inbound, params: Vec<ReconfigParam>) {
        let mut responses = Vec::new();
        for param in params {
            match param {
                ReconfigParam::Response { response_sn, result, .. } => {
                    self.on_reconfig_response(response_sn, result);
                }
                request => responses.extend(self.on_peer_request(now, &request)),
            }
        }
        if !responses.is_empty() {
            self.ctx.send(Chunk::ReConfig { params: responses }, inbound.source);
        }
        self.flush_deferred_incoming_reset();
        inbound.transmit = true;
    }

    /// Answers one peer request. `None` means the answer is the outgoing
    /// reset request we just sent.
    fn on_peer_request(&mut self, now: Instant, request: &ReconfigParam) -> Option<ReconfigParam> {
        let request_sn = request.request_sn()?;
        let param_type = request.param_type();
        let response = |result, next_tsns| ReconfigParam::Response {
            response_sn: request_sn,
            result,
            next_tsns,
        };
        if let Some(record) = self.reconfig.peer_results.get(&request_sn) {
            let (result, next_tsns) = if record.param_type == param_type {
                (record.result, record.next_tsns)
            } else {
                (ReconfigResult::NoReset, None)
            };
            trace!("Repeating result {:?} for request {}", result, request_sn);
            return Some(response(result, next_tsns));
        }
        let expected = self.reconfig.expected_peer_sn;
        if request_sn != expected {
            let busy = self.reconfig.deferred_outgoing.is_some()
                || self.reconfig.deferred_incoming.is_some()
                || self.reconfig.deferred_tsn_reset.is_some();
            let result = if tsn_gt(request_sn, expected) && busy {
                ReconfigResult::RequestInProgress
            } else {
                ReconfigResult::NoReset
            };
            debug!(
                "Request {} out of sequence (expected {}): {:?}",
                request_sn, expected, result
            );
            return Some(response(result, None));
        }
        self.reconfig.expected_peer_sn = expected.wrapping_add(1);

        let mut next_tsns = None;
        let result = match request {
            ReconfigParam::OutgoingReset {
                response_sn,
                last_tsn,
                streams,
                ..
            } => {
                self.complete_incoming_request(*response_sn);
                Some(self.peer_outgoing_reset(now, request_sn, *last_tsn, streams))
            }
            ReconfigParam::IncomingReset { streams, .. } => self.peer_incoming_reset(request_sn, streams),
            ReconfigParam::SsnTsnReset { .. } => {
                let (result, tsns) = self.peer_ssn_tsn_reset(request_sn);
                next_tsns = tsns;
                Some(result)
            }
            ReconfigParam::AddOutgoingStreams { count, .. } => Some(self.peer_add_streams(*count, true)),
            ReconfigParam::AddIncomingStreams { count, .. } => Some(self.peer_add_streams(*count, false)),
            ReconfigParam::Response { .. } => None,
        };
        debug!("Peer request {} ({}): {:?}", request_sn, param_type, result);
        self.reconfig.remember(
            request_sn,
            param_type,
            result.unwrap_or(ReconfigResult::Performed),
            next_tsns,
        );
        result.map(|r| response(r, next_tsns))
    }

    fn peer_outgoing_reset(&mut self, now: Instant, request_sn: u32, last_tsn: u32, streams: &[u16]) -> ReconfigResult {
        if streams.iter().any(|sid| *sid >= self.streams.inbound_count()) {
            return ReconfigResult::Denied;
        }
        if self.reconfig.deferred_outgoing.is_some() {
            return ReconfigResult::RequestInProgress;
        }
        let streams = self.streams.all_inbound_if_empty(streams);
        if tsn_gt(last_tsn, self.received.cum_ack_tsn()) {
            self.reconfig.deferred_outgoing = Some(DeferredPeerOutgoing {
                request_sn,
                last_tsn,
                streams,
            });
            return ReconfigResult::Deferred;
        }
        self.apply_incoming_reset(now, &streams)
    }

    fn apply_incoming_reset(&mut self, _now: Instant, streams: &[u16]) -> ReconfigResult {
        if streams.iter().all(|sid| self.streams.expected_ssn(*sid) == Some(0)) {
            return ReconfigResult::NothingToDo;
        }
        self.streams.reset_incoming(streams);
        self.ctx.indicate(Indication::ResetCompleted {
            streams: streams.to_vec(),
            direction: ResetDirection::Incoming,
        });
        let ready = self.streams.drain_deliverable();
        self.deliver_all(ready);
        ReconfigResult::Performed
    }

    /// Completes a deferred peer outgoing reset once all data up to its last
    /// TSN has arrived.
    pub(crate) fn complete_deferred_outgoing_reset(&mut self, now: Instant) {
        let Some(deferred) = &self.reconfig.deferred_outgoing else {
            return;
        };
        if tsn_gt(deferred.last_tsn, self.received.cum_ack_tsn()) {
            return;
        }
        let Some(deferred) = self.reconfig.deferred_outgoing.take() else {
            return;
        };
        let result = self.apply_incoming_reset(now, &deferred.streams);
        debug!("Deferred request {} completed: {:?}", deferred.request_sn, result);
        self.reconfig.update_result(deferred.request_sn, result, None);
        self.send_to_primary(Chunk::ReConfig {
            params: vec![ReconfigParam::Response {
                response_sn: deferred.request_sn,
                result,
                next_tsns: None,
            }],
        });
    }

    fn tsn_reset_blocked(&self) -> bool {
        !self.queues.is_empty() || self.streams.any_fragment_in_progress()
    }

    fn peer_ssn_tsn_reset(&mut self, request_sn: u32) -> (ReconfigResult, Option<(u32, u32)>) {
        if self.reconfig.deferred_tsn_reset.is_some() {
            return (ReconfigResult::RequestInProgress, None);
        }
        if self.tsn_reset_blocked() {
            self.reconfig.deferred_tsn_reset = Some(request_sn);
            return (ReconfigResult::Deferred, None);
        }
        (ReconfigResult::Performed, Some(self.apply_ssn_tsn_reset()))
    }

    /// Moves both TSN spaces forward and restarts every stream at SSN 0.
    /// Returns our next TSN and the next TSN the peer must use.
    fn apply_ssn_tsn_reset(&mut self) -> (u32, u32) {
        let sender_next = self.next_tsn.wrapping_add(TSN_RESET_JUMP);
        let acked = sender_next.wrapping_sub(1);
        self.next_tsn = sender_next;
        self.last_tsn_ack = acked;
        self.highest_tsn_acked = acked;
        self.advanced_peer_ack_point = acked;
        self.last_sack_sequence = None;
        for path in self.paths.iter_mut() {
            path.cuc = Default::default();
            path.fast_recovery_exit = None;
        }

        let receiver_next = self
            .received
            .highest_tsn()
            .wrapping_add(TSN_RESET_JUMP)
            .wrapping_add(1);
        self.received = GapList::new(receiver_next.wrapping_sub(1));
        self.duplicates.clear();

        let outbound = self.streams.all_outbound_if_empty(&[]);
        let inbound = self.streams.all_inbound_if_empty(&[]);
        self.streams.reset_outgoing(&outbound);
        self.streams.reset_incoming(&inbound);
        debug!(
            "SSN/TSN reset: sending from TSN {}, expecting TSN {}",
            sender_next, receiver_next
        );
        self.ctx.indicate(Indication::ResetCompleted {
            streams: outbound,
            direction: ResetDirection::Outgoing,
        });
        self.ctx.indicate(Indication::ResetCompleted {
            streams: inbound,
            direction: ResetDirection::Incoming,
        });
        (sender_next, receiver_next)
    }

    /// Performs a deferred peer SSN/TSN reset once our data is acknowledged.
    pub(crate) fn flush_deferred_tsn_reset(&mut self) {
        let Some(request_sn) = self.reconfig.deferred_tsn_reset else {
            return;
        };
        if self.state != AssociationState::Established || self.tsn_reset_blocked() {
            return;
        }
        self.reconfig.deferred_tsn_reset = None;
        let next_tsns = Some(self.apply_ssn_tsn_reset());
        debug!("Deferred SSN/TSN reset {} completed", request_sn);
        self.reconfig.update_result(request_sn, ReconfigResult::Performed, next_tsns);
        self.send_to_primary(Chunk::ReConfig {
            params: vec![ReconfigParam::Response {
                response_sn: request_sn,
                result: ReconfigResult::Performed,
                next_tsns,
            }],
        });
    }

    fn stream_busy(&self, sid: u16) -> bool {
        self.queues.bytes_in_flight_for_stream(sid) > 0 || self.streams.fragment_in_progress(sid)
    }

    fn peer_incoming_reset(&mut self, request_sn: u32, streams: &[u16]) -> Option<ReconfigResult> {
        if streams.iter().any(|sid| *sid >= self.streams.outbound_count()) {
            return Some(ReconfigResult::Denied);
        }
        let streams = self.streams.all_outbound_if_empty(streams);
        let covered = self.reconfig.outstanding.iter().any(|r| match &r.request {
            LocalRequest::Outgoing { streams: ours, answers: None } => {
                let ours = self.streams.all_outbound_if_empty(ours);
                streams.iter().all(|sid| ours.contains(sid))
            }
            _ => false,
        });
        if covered {
            return Some(ReconfigResult::NothingToDo);
        }
        if self.reconfig.deferred_incoming.is_some() {
            return Some(ReconfigResult::RequestInProgress);
        }
        if streams
            .iter()
            .all(|sid| self.streams.next_ssn(*sid) == Some(0) && !self.stream_busy(*sid))
        {
            return Some(ReconfigResult::NothingToDo);
        }
        self.streams.set_reset_pending(&streams, true);
        if !self.reconfig.outstanding.is_empty() || streams.iter().any(|sid| self.stream_busy(*sid)) {
            self.reconfig.deferred_incoming = Some(DeferredPeerIncoming { request_sn, streams });
            return Some(ReconfigResult::Deferred);
        }
        self.reset_outgoing_for_peer(request_sn, streams);
        None
    }

    /// Resets our outgoing streams on behalf of a peer incoming request and
    /// sends the matching outgoing request.
    fn reset_outgoing_for_peer(&mut self, request_sn: u32, streams: Vec<u16>) {
        self.streams.reset_outgoing(&streams);
        self.ctx.indicate(Indication::ResetCompleted {
            streams: streams.clone(),
            direction: ResetDirection::Outgoing,
        });
        self.reconfig.update_result(request_sn, ReconfigResult::Performed, None);
        self.queue_requests(vec![LocalRequest::Outgoing {
            streams,
            answers: Some(request_sn),
        }]);
    }

    /// Finishes a deferred peer incoming reset once our data on the streams
    /// has been acknowledged.
    pub(crate) fn flush_deferred_incoming_reset(&mut self) {
        if self.state != AssociationState::Established || !self.reconfig.outstanding.is_empty() {
            return;
        }
        let Some(deferred) = &self.reconfig.deferred_incoming else {
            return;
        };
        if deferred.streams.iter().any(|sid| self.stream_busy(*sid)) {
            return;
        }
        let Some(deferred) = self.reconfig.deferred_incoming.take() else {
            return;
        };
        debug!("Deferred incoming reset {} can proceed", deferred.request_sn);
        self.reset_outgoing_for_peer(deferred.request_sn, deferred.streams);
    }

    /// `outgoing` is true when the peer adds streams towards us.
    fn peer_add_streams(&mut self, count: u16, outgoing: bool) -> ReconfigResult {
        if count == 0 {
            return ReconfigResult::NothingToDo;
        }
        let current = if outgoing {
            self.streams.inbound_count()
        } else {
            self.streams.outbound_count()
        };
        if current as u32 + count as u32 > u16::MAX as u32 {
            return ReconfigResult::Denied;
        }
        if outgoing {
            self.streams.add_inbound(count);
            self.ctx.indicate(Indication::StreamsAdded {
                inbound: count,
                outbound: 0,
            });
        } else {
            self.streams.add_outbound(count);
            self.ctx.indicate(Indication::StreamsAdded {
                inbound: 0,
                outbound: count,
            });
        }
        ReconfigResult::Performed
    }

    /// The peer's outgoing reset answers our incoming request `response_sn`.
    fn complete_incoming_request(&mut self, response_sn: u32) {
        let mut matched = false;
        for tracked in &mut self.reconfig.outstanding {
            if tracked.request_sn == response_sn
                && !tracked.done
                && matches!(tracked.request, LocalRequest::Incoming { .. })
            {
                tracked.done = true;
                matched = true;
            }
        }
        if matched {
            self.finish_if_done();
        }
    }

    fn on_reconfig_response(&mut self, response_sn: u32, result: ReconfigResult) {
        let Some(index) = self
            .reconfig
            .outstanding
            .iter()
            .position(|r| r.request_sn == response_sn && !r.done && r.param.is_some())
        else {
            trace!("Response for unknown request {}", response_sn);
            return;
        };
        if result == ReconfigResult::Deferred || result == ReconfigResult::RequestInProgress {
            debug!("Request {} pending at peer: {:?}", response_sn, result);
            return;
        }
        let tracked = &mut self.reconfig.outstanding[index];
        tracked.done = true;
        let request = tracked.request.clone();
        if result.is_success() {
            self.apply_local_request(request, result);
        } else {
            debug!("Request {} failed: {:?}", response_sn, result);
            if let LocalRequest::Outgoing { streams, answers: None } = &request {
                let all = self.streams.all_outbound_if_empty(streams);
                self.streams.set_reset_pending(&all, false);
            }
            self.ctx.indicate(Indication::ResetFailed {
                request_sn: response_sn,
                result,
            });
        }
        self.finish_if_done();
    }

    fn apply_local_request(&mut self, request: LocalRequest, result: ReconfigResult) {
        match request {
            LocalRequest::Outgoing { streams, answers: None } => {
                let all = self.streams.all_outbound_if_empty(&streams);
                self.streams.reset_outgoing(&all);
                self.ctx.indicate(Indication::ResetCompleted {
                    streams: all,
                    direction: ResetDirection::Outgoing,
                });
            }
            LocalRequest::Outgoing { answers: Some(_), .. } => {}
            LocalRequest::Incoming { streams } => {
                // Performed arrives together with the peer's outgoing
                // request, which reports completion.
                if result == ReconfigResult::NothingToDo {
                    let all = self.streams.all_inbound_if_empty(&streams);
                    self.ctx.indicate(Indication::ResetCompleted {
                        streams: all,
                        direction: ResetDirection::Incoming,
                    });
                }
            }
            LocalRequest::AddOutgoing(count) => {
                self.streams.add_outbound(count);
                self.ctx.indicate(Indication::StreamsAdded {
                    inbound: 0,
                    outbound: count,
                });
            }
            LocalRequest::AddIncoming(count) => {
                self.streams.add_inbound(count);
                self.ctx.indicate(Indication::StreamsAdded {
                    inbound: count,
                    outbound: 0,
                });
            }
        }
    }

    fn finish_if_done(&mut self) {
        if self.reconfig.outstanding.iter().all(|r| r.done) {
            self.reconfig.outstanding.clear();
            self.timers.stop(&mut self.ctx, TimerId::StreamReset);
            self.flush_deferred_incoming_reset();
        }
    }
}
