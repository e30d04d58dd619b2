//! Outbound DATA scheduling: retransmissions first, then new fragments, both
//! bounded by the per-path congestion window and the peer's receive window.

use super::sack::release_outstanding;
use super::{Association, AssociationState, Inbound};
use crate::chunk::{Chunk, ForwardTsn, PacketDrop};
use crate::context::AssociationContext;
use crate::path::PathId;
use crate::queue::{ChunkFlags, DataChunk};
use crate::timer::TimerId;
use crate::tsn::tsn_gt;
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::{debug, trace};

impl<C: AssociationContext> Association<C> {
    /// Sends whatever the windows allow.
    pub(crate) fn transmit(&mut self, now: Instant) {
        if !self.state.carries_data() {
            return;
        }
        self.retransmit_pending(now);
        self.send_new_data(now);
        self.advance_peer_ack_point(false);
        if self.state == AssociationState::Established {
            self.send_outstanding_requests();
        }
    }

    fn rwnd_allows(&self, len: usize) -> bool {
        // One chunk may always probe a closed window.
        self.peer_rwnd as usize >= len || self.outstanding_bytes() == 0
    }

    fn retransmit_pending(&mut self, now: Instant) {
        let base = self.last_tsn_ack;
        let mut tsns: Vec<u32> = self.queues.transmission.keys().copied().collect();
        tsns.sort_by_key(|t| t.wrapping_sub(base));

        // Fast retransmissions ignore cwnd for one packet per path.
        let mut fast_budget: BTreeMap<PathId, usize> = BTreeMap::new();
        for tsn in tsns {
            let Some(chunk) = self.queues.get(tsn) else {
                continue;
            };
            if chunk
                .max_retransmissions
                .is_some_and(|max| chunk.retransmissions >= max)
            {
                self.abandon(tsn);
                continue;
            }
            let len = chunk.len();
            let fast = chunk.flags.fast_retransmitted;
            let Some(dest) = chunk
                .next_path
                .filter(|id| self.paths.get(*id).is_some())
                .or_else(|| self.paths.retransmit_destination(chunk.last_path))
            else {
                continue;
            };
            let Some(path) = self.paths.get(dest) else {
                continue;
            };
            let budget = fast_budget
                .entry(dest)
                .or_insert(path.pmtu.saturating_sub(crate::config::COMMON_HEADER_SIZE));
            let within_budget = fast && *budget >= len + crate::config::DATA_CHUNK_HEADER_SIZE;
            if !self.cc.can_send(path) && !within_budget {
                continue;
            }
            if !self.rwnd_allows(len) && !within_budget {
                continue;
            }
            if within_budget {
                *budget -= len + crate::config::DATA_CHUNK_HEADER_SIZE;
            }
            self.queues.cancel_retransmission(tsn);
            self.put_on_wire(now, tsn, dest, true);
        }
    }

    fn send_new_data(&mut self, now: Instant) {
        while self.streams.has_sendable() {
            if self.reconfig.holds_new_data() && !self.streams.any_fragment_in_progress() {
                trace!("Holding new data until the SSN/TSN reset completes");
                break;
            }
            let Some(dest) = self.pick_data_destination() else {
                break;
            };
            let Some(fragment) = self.streams.peek_fragment_len() else {
                break;
            };
            if !self.rwnd_allows(fragment) {
                trace!("Peer window {} closed for {} bytes", self.peer_rwnd, fragment);
                break;
            }
            let Some(fragment) = self.streams.next_fragment() else {
                break;
            };
            let tsn = self.next_tsn;
            self.next_tsn = self.next_tsn.wrapping_add(1);
            self.queues.insert_sent(DataChunk {
                tsn,
                stream_id: fragment.stream_id,
                stream_seq: fragment.stream_seq,
                ppid: fragment.ppid,
                unordered: fragment.unordered,
                beginning: fragment.beginning,
                ending: fragment.ending,
                payload: fragment.payload,
                last_path: None,
                next_path: Some(dest),
                transmissions: 0,
                retransmissions: 0,
                send_time: None,
                max_retransmissions: fragment.max_retransmissions,
                flags: ChunkFlags::default(),
                gap_reports: 0,
            });
            self.put_on_wire(now, tsn, dest, false);
        }
    }

    /// First active path whose congestion window has room, starting with the
    /// regular data destination.
    fn pick_data_destination(&mut self) -> Option<PathId> {
        let first = self.paths.data_destination(self.config.cmt)?;
        if self.paths.get(first).is_some_and(|p| self.cc.can_send(p)) {
            return Some(first);
        }
        if !self.config.cmt {
            return None;
        }
        self.paths
            .iter()
            .filter(|p| p.active && self.cc.can_send(p))
            .map(|p| p.id)
            .next()
    }

    /// Sends a chunk that sits in the retransmission queue and accounts for
    /// it on `dest`.
    fn put_on_wire(&mut self, now: Instant, tsn: u32, dest: PathId, retransmission: bool) {
        let Some(path) = self.paths.get_mut(dest) else {
            return;
        };
        let Some(chunk) = self.queues.get_mut(tsn) else {
            return;
        };
        if retransmission {
            chunk.retransmissions += 1;
            if chunk.last_path.is_some_and(|last| last != dest) {
                chunk.flags.moved = true;
            }
            trace!("Retransmitting TSN {} on {}", tsn, dest);
        }
        chunk.transmissions += 1;
        chunk.last_path = Some(dest);
        chunk.next_path = None;
        chunk.send_time = Some(now);
        chunk.gap_reports = 0;
        chunk.flags.acked = false;
        chunk.flags.packet_dropped = false;
        if !chunk.flags.counts_as_outstanding {
            chunk.flags.counts_as_outstanding = true;
            path.outstanding_bytes += chunk.len();
        }
        self.peer_rwnd = self.peer_rwnd.saturating_sub(chunk.len() as u32);
        path.last_send = Some(now);
        let remote = path.remote;
        let rto = path.rto.rto();
        let wire = Chunk::Data(chunk.to_wire());
        self.ctx.send(wire, remote);
        let timer = TimerId::Retransmission(dest);
        if !self.timers.is_running(timer) {
            self.timers.start(&mut self.ctx, timer, rto);
        }
    }

    /// Gives up on a partially reliable chunk and every other fragment of its
    /// message.
    pub(crate) fn abandon(&mut self, tsn: u32) {
        let Some(chunk) = self.queues.get(tsn) else {
            return;
        };
        let (sid, ssn, unordered) = (chunk.stream_id, chunk.stream_seq, chunk.unordered);
        let siblings: Vec<u32> = self
            .queues
            .all()
            .filter(|c| {
                c.stream_id == sid && c.stream_seq == ssn && c.unordered == unordered && !c.flags.abandoned
            })
            .map(|c| c.tsn)
            .collect();
        for tsn in siblings {
            let pending = self.queues.is_pending_transmission(tsn);
            if let Some(chunk) = self.queues.get_mut(tsn) {
                debug!("Abandoning TSN {} after {} retransmissions", tsn, chunk.retransmissions);
                chunk.flags.abandoned = true;
                if chunk.flags.counts_as_outstanding {
                    self.peer_rwnd = self.peer_rwnd.saturating_add(chunk.len() as u32);
                }
                release_outstanding(&mut self.paths, chunk);
            }
            if pending {
                self.queues.cancel_retransmission(tsn);
            }
        }
    }

    /// Moves the advanced peer ack point over abandoned chunks and tells the
    /// peer with FORWARD TSN. With `resend` the FORWARD TSN goes out even if
    /// the point did not move, since the peer has not caught up yet.
    pub(crate) fn advance_peer_ack_point(&mut self, resend: bool) {
        if !self.state.carries_data() && self.state != AssociationState::ShutdownSent {
            return;
        }
        let mut point = self.last_tsn_ack;
        let mut skipped: BTreeMap<u16, u16> = BTreeMap::new();
        while let Some(chunk) = self
            .queues
            .get(point.wrapping_add(1))
            .filter(|c| c.flags.abandoned)
        {
            if !chunk.unordered {
                skipped.insert(chunk.stream_id, chunk.stream_seq);
            }
            point = point.wrapping_add(1);
        }
        if !tsn_gt(point, self.last_tsn_ack) {
            return;
        }
        let moved = tsn_gt(point, self.advanced_peer_ack_point);
        if moved {
            self.advanced_peer_ack_point = point;
        }
        if moved || resend {
            debug!("Sending FORWARD TSN to {}", point);
            self.send_to_primary(Chunk::ForwardTsn(ForwardTsn {
                new_cum_tsn: point,
                streams: skipped.into_iter().collect(),
            }));
        }
    }

    /// The peer or a middlebox dropped packets: resend the reported chunks on
    /// the same path without treating the drop as congestion.
    pub(crate) fn on_packet_drop(&mut self, inbound: &mut Inbound, report: PacketDrop) {
        let tsns = report.dropped_data_tsns();
        debug!(
            "PACKET DROP report for {} chunk(s), bad checksum {}",
            tsns.len(),
            report.bad_checksum
        );
        for tsn in tsns {
            let pending = self.queues.is_pending_transmission(tsn);
            let Some(chunk) = self.queues.get_mut(tsn) else {
                continue;
            };
            if pending || chunk.flags.acked || chunk.flags.abandoned || chunk.flags.packet_dropped {
                continue;
            }
            chunk.flags.packet_dropped = true;
            chunk.next_path = chunk.last_path;
            if chunk.flags.counts_as_outstanding {
                self.peer_rwnd = self.peer_rwnd.saturating_add(chunk.len() as u32);
            }
            release_outstanding(&mut self.paths, chunk);
            self.queues.schedule_retransmission(tsn);
        }
        inbound.transmit = true;
    }
}
