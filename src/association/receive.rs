//! Receiver side: DATA acceptance, duplicate tracking, reneging under buffer
//! pressure, FORWARD TSN and SACK generation.

use super::{Association, AssociationState, Inbound};
use crate::chunk::{
    CAUSE_INVALID_STREAM, CAUSE_NO_USER_DATA, Chunk, Data, ErrorCause, ForwardTsn, PacketDrop, Sack,
};
use crate::config::DATA_CHUNK_HEADER_SIZE;
use crate::context::{AssociationContext, ConnectionLossReason, Message};
use crate::error::SctpResult;
use crate::gap_list::AckKind;
use crate::timer::TimerId;
use crate::tsn::tsn_gt;
use bytes::{BufMut, BytesMut};
use std::time::Instant;
use tracing::{debug, trace};

/// Duplicate TSNs reported per SACK.
const MAX_REPORTED_DUPLICATES: usize = 32;

impl<C: AssociationContext> Association<C> {
    pub(crate) fn on_data(&mut self, now: Instant, inbound: &mut Inbound, data: Data) -> SctpResult<()> {
        match self.state {
            AssociationState::Closed => {
                debug!("DATA from {} without an association", inbound.source);
                self.ctx.send(
                    Chunk::Abort {
                        reflected: true,
                        causes: Vec::new(),
                    },
                    inbound.source,
                );
                inbound.stop = true;
                return Ok(());
            }
            AssociationState::CookieWait
            | AssociationState::ShutdownReceived
            | AssociationState::ShutdownAckSent => {
                trace!("Discarding DATA in state {:?}", self.state);
                return Ok(());
            }
            _ => {}
        }

        if data.payload.is_empty() {
            let mut info = BytesMut::with_capacity(4);
            info.put_u32(data.tsn);
            self.send_abort(vec![ErrorCause::new(CAUSE_NO_USER_DATA, info.freeze())]);
            self.ctx.indicate(crate::context::Indication::ConnectionLost(
                ConnectionLossReason::ProtocolViolation,
            ));
            self.teardown();
            inbound.stop = true;
            return Ok(());
        }

        inbound.data_received = true;
        if inbound.path.is_some() {
            self.last_data_path = inbound.path;
        }
        if data.immediate {
            inbound.immediate_sack = true;
        }
        let tsn = data.tsn;
        if self.received.is_received(tsn) {
            trace!("Duplicate TSN {}", tsn);
            if self.duplicates.len() < MAX_REPORTED_DUPLICATES {
                self.duplicates.push(tsn);
            }
            inbound.duplicate = true;
            return Ok(());
        }

        let kind = if self.config.enable_reneging {
            AckKind::Revocable
        } else {
            AckKind::NonRevocable
        };
        if data.stream_id >= self.streams.inbound_count() {
            debug!("DATA for invalid stream {}", data.stream_id);
            let mut info = BytesMut::with_capacity(4);
            info.put_u16(data.stream_id);
            info.put_u16(0);
            self.ctx.send(
                Chunk::Error {
                    causes: vec![ErrorCause::new(CAUSE_INVALID_STREAM, info.freeze())],
                },
                inbound.source,
            );
            self.received.mark_received(tsn, kind);
            return Ok(());
        }

        let len = data.payload.len();
        if self.streams.buffered_bytes() + len > self.config.receive_window && !self.make_room(tsn, len) {
            debug!(
                "Receive buffer full ({} bytes), dropping TSN {}",
                self.streams.buffered_bytes(),
                tsn
            );
            self.queue_drop_report(&data);
            inbound.immediate_sack = true;
            return Ok(());
        }

        self.received.mark_received(tsn, kind);
        let ready = self.streams.receive(data);
        self.deliver_all(ready);
        self.complete_deferred_outgoing_reset(now);
        Ok(())
    }

    /// Hands reassembled messages to the user. Delivered TSNs can no longer
    /// be reneged.
    pub(crate) fn deliver_all(&mut self, ready: Vec<(Message, Vec<u32>)>) {
        for (message, tsns) in ready {
            if self.config.nr_sack {
                let cum = self.received.cum_ack_tsn();
                for tsn in tsns {
                    if tsn_gt(tsn, cum) {
                        self.received.insert(tsn, AckKind::NonRevocable);
                    }
                }
            }
            self.ctx.deliver(message);
        }
    }

    /// Drops revocably acknowledged fragments above `tsn` until `len` bytes
    /// fit. Returns false if not enough could be freed.
    fn make_room(&mut self, tsn: u32, len: usize) -> bool {
        if !self.config.enable_reneging {
            return false;
        }
        let window = self.config.receive_window;
        for victim in self.streams.buffered_tsns_above(tsn) {
            if self.received.kind_of(victim) != Some(AckKind::Revocable) {
                continue;
            }
            let freed = self.streams.drop_fragment(victim);
            self.received.renege(victim);
            debug!("Reneged TSN {} ({} bytes)", victim, freed);
            if self.streams.buffered_bytes() + len <= window {
                return true;
            }
        }
        false
    }

    fn queue_drop_report(&mut self, data: &Data) {
        if !self.config.packet_drop_reports || self.pending_drop_report.is_some() {
            return;
        }
        let mut packet = BytesMut::with_capacity(12 + DATA_CHUNK_HEADER_SIZE);
        packet.put_u16(self.config.remote_port);
        packet.put_u16(self.config.local_port);
        packet.put_u32(self.local_tag);
        packet.put_u32(0);
        let mut flags = 0u8;
        if data.ending {
            flags |= 0x01;
        }
        if data.beginning {
            flags |= 0x02;
        }
        if data.unordered {
            flags |= 0x04;
        }
        packet.put_u8(0);
        packet.put_u8(flags);
        packet.put_u16((DATA_CHUNK_HEADER_SIZE + data.payload.len()) as u16);
        packet.put_u32(data.tsn);
        packet.put_u16(data.stream_id);
        packet.put_u16(data.stream_seq);
        packet.put_u32(data.ppid);
        self.pending_drop_report = Some(PacketDrop {
            from_middlebox: false,
            bad_checksum: false,
            truncated: true,
            bandwidth: 0,
            queue_size: u32::try_from(self.streams.buffered_bytes()).unwrap_or(u32::MAX),
            truncated_length: (12 + DATA_CHUNK_HEADER_SIZE + data.payload.len()) as u16,
            packet: packet.freeze(),
        });
    }

    pub(crate) fn on_forward_tsn(&mut self, now: Instant, inbound: &mut Inbound, fwd: ForwardTsn) {
        inbound.data_received = true;
        inbound.immediate_sack = true;
        if !tsn_gt(fwd.new_cum_tsn, self.received.cum_ack_tsn()) {
            trace!("Stale FORWARD TSN {}", fwd.new_cum_tsn);
            return;
        }
        debug!("FORWARD TSN moves cumulative TSN to {}", fwd.new_cum_tsn);
        self.received.forward_cum_ack(fwd.new_cum_tsn);
        let ready = self.streams.skip(fwd.new_cum_tsn, &fwd.streams);
        self.deliver_all(ready);
        self.complete_deferred_outgoing_reset(now);
    }

    /// Advertised receive window.
    pub(crate) fn local_rwnd(&self) -> u32 {
        let free = self
            .config
            .receive_window
            .saturating_sub(self.streams.buffered_bytes());
        u32::try_from(free).unwrap_or(u32::MAX)
    }

    pub(crate) fn send_sack(&mut self) {
        let Some(dest) = self
            .last_data_path
            .filter(|id| self.paths.get(*id).is_some_and(|p| p.active))
            .or(self.paths.primary())
        else {
            return;
        };
        let max = self.config.max_gap_blocks;
        let (gap_blocks, nr_gap_blocks) = if self.config.nr_sack {
            (
                self.received.gap_blocks(Some(AckKind::Revocable), max),
                self.received.gap_blocks(Some(AckKind::NonRevocable), max),
            )
        } else {
            (self.received.gap_blocks(None, max), Vec::new())
        };
        let sack = Sack {
            cum_tsn_ack: self.received.cum_ack_tsn(),
            a_rwnd: self.local_rwnd(),
            gap_blocks,
            nr_gap_blocks,
            duplicates: std::mem::take(&mut self.duplicates),
            nr_subtract_r_gaps: false,
            sequence: Some(self.sack_sequence),
        };
        self.sack_sequence = self.sack_sequence.wrapping_add(1);
        self.packets_since_sack = 0;
        self.timers.stop(&mut self.ctx, TimerId::DelayedSack);
        trace!(
            "Sending SACK cum {} with {} gap block(s)",
            sack.cum_tsn_ack,
            sack.gap_blocks.len() + sack.nr_gap_blocks.len()
        );
        self.send_to_path(dest, Chunk::Sack(sack));
    }
}
