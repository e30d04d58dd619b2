//! Sender-side acknowledgment processing: cumulative and gap acks, miss
//! indications, fast retransmit, reneging and the CMT pseudo-cumulative acks
//! that gate window growth.

use super::{Association, AssociationState, Inbound};
use crate::chunk::Sack;
use crate::context::{AssociationContext, Indication};
use crate::error::SctpResult;
use crate::gap_list::{AckKind, GapList};
use crate::path::{Path, PathId, PathSet, PseudoCumAck};
use crate::queue::{DataChunk, OutboundQueues};
use crate::timer::TimerId;
use crate::tsn::{tsn_gt, tsn_lt};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// What one SACK did to one path.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PathSackState {
    pub(crate) newly_acked_bytes: usize,
    pub(crate) new_cum_ack: bool,
    pub(crate) new_pseudo_cum_ack: bool,
    pub(crate) new_rtx_pseudo_cum_ack: bool,
    /// A chunk last sent here was marked for fast retransmit.
    pub(crate) requires_rtx: bool,
    /// Cleared once the lowest missing TSN sent here has been examined.
    pub(crate) find_lowest_tsn: bool,
    /// The lowest outstanding TSN on this path is being retransmitted.
    pub(crate) lowest_tsn_retransmitted: bool,
}

impl Default for PathSackState {
    fn default() -> Self {
        Self {
            newly_acked_bytes: 0,
            new_cum_ack: false,
            new_pseudo_cum_ack: false,
            new_rtx_pseudo_cum_ack: false,
            requires_rtx: false,
            find_lowest_tsn: true,
            lowest_tsn_retransmitted: false,
        }
    }
}

pub(crate) type SackScratch = BTreeMap<PathId, PathSackState>;

#[derive(Debug, Default)]
pub(crate) struct SackOutcome {
    pub(crate) rtt_sample: Option<Duration>,
    /// Bytes removed from the retransmission queue.
    pub(crate) freed_bytes: usize,
    pub(crate) highest_new_ack: Option<u32>,
    pub(crate) fast_retransmits: Vec<u32>,
    pub(crate) reneged: Vec<u32>,
}

impl SackOutcome {
    fn sample(&mut self, rtt: Duration) {
        self.rtt_sample = Some(self.rtt_sample.map_or(rtt, |s| s.min(rtt)));
    }

    fn merge(&mut self, other: SackOutcome) {
        if let Some(rtt) = other.rtt_sample {
            self.sample(rtt);
        }
        self.freed_bytes += other.freed_bytes;
        if let Some(tsn) = other.highest_new_ack {
            self.note_new_ack(tsn);
        }
        self.fast_retransmits.extend(other.fast_retransmits);
        self.reneged.extend(other.reneged);
    }

    fn note_new_ack(&mut self, tsn: u32) {
        match self.highest_new_ack {
            Some(h) if !tsn_gt(tsn, h) => {}
            _ => self.highest_new_ack = Some(tsn),
        }
    }
}

/// Takes a chunk's bytes out of its path's outstanding count.
pub(crate) fn release_outstanding(paths: &mut PathSet, chunk: &mut DataChunk) {
    if !chunk.flags.counts_as_outstanding {
        return;
    }
    chunk.flags.counts_as_outstanding = false;
    if let Some(path) = chunk.last_path.and_then(|id| paths.get_mut(id)) {
        path.release_outstanding(chunk.len());
    }
}

/// Credits a first acknowledgment of `chunk` to its path.
fn credit_newly_acked(scratch: &mut SackScratch, chunk: &mut DataChunk) {
    if chunk.flags.counted_as_newly_acked || chunk.flags.abandoned {
        return;
    }
    chunk.flags.counted_as_newly_acked = true;
    if let Some(id) = chunk.last_path {
        scratch.entry(id).or_default().newly_acked_bytes += chunk.len();
    }
}

/// Karn's rule: only unambiguous first transmissions acknowledged on the path
/// they were sent on produce RTT samples.
fn rtt_candidate(chunk: &DataChunk, sack_path: Option<PathId>, now: Instant) -> Option<Duration> {
    if chunk.transmissions != 1
        || chunk.flags.moved
        || chunk.flags.reneged
        || chunk.flags.acked
        || chunk.last_path.is_none()
        || chunk.last_path != sack_path
    {
        return None;
    }
    chunk.send_time.map(|sent| now.saturating_duration_since(sent))
}

/// Tracks the lowest outstanding first transmission and retransmission per
/// path. Chunks are visited in TSN order.
fn track_pseudo_cum_ack(cuc: &mut PseudoCumAck, state: &mut PathSackState, chunk: &DataChunk, acked_now: bool) {
    let tsn = chunk.tsn;
    if chunk.transmissions <= 1 {
        if cuc.find_pseudo_cum_ack && !acked_now {
            cuc.pseudo_cum_ack = Some(tsn);
            cuc.find_pseudo_cum_ack = false;
        }
        if acked_now && cuc.pseudo_cum_ack == Some(tsn) {
            state.new_pseudo_cum_ack = true;
            cuc.find_pseudo_cum_ack = true;
        }
    } else {
        if cuc.find_rtx_pseudo_cum_ack && !acked_now {
            cuc.rtx_pseudo_cum_ack = Some(tsn);
            cuc.find_rtx_pseudo_cum_ack = false;
        }
        if acked_now && cuc.rtx_pseudo_cum_ack == Some(tsn) {
            state.new_rtx_pseudo_cum_ack = true;
            cuc.find_rtx_pseudo_cum_ack = true;
        }
    }
}

fn cuc_for<'a>(paths: &'a mut PathSet, chunk: &DataChunk) -> Option<(PathId, &'a mut Path)> {
    let id = chunk.last_path?;
    paths.get_mut(id).map(|p| (id, p))
}

/// Removes every chunk at or below `cum` from the queues.
pub(crate) fn dequeue_cumulative(
    queues: &mut OutboundQueues,
    paths: &mut PathSet,
    scratch: &mut SackScratch,
    cum: u32,
    sack_path: Option<PathId>,
    now: Instant,
) -> SackOutcome {
    let mut outcome = SackOutcome::default();
    for tsn in queues.tsns_up_to(cum) {
        let Some(mut chunk) = queues.remove(tsn) else {
            continue;
        };
        if !chunk.flags.acked {
            if let Some(rtt) = rtt_candidate(&chunk, sack_path, now) {
                outcome.sample(rtt);
            }
            if let Some((id, path)) = cuc_for(paths, &chunk) {
                let state = scratch.entry(id).or_default();
                state.new_cum_ack = true;
                state.new_pseudo_cum_ack = true;
                state.new_rtx_pseudo_cum_ack = true;
                path.cuc.find_pseudo_cum_ack = true;
                path.cuc.find_rtx_pseudo_cum_ack = true;
            }
            if !chunk.flags.abandoned && !chunk.flags.reneged {
                outcome.note_new_ack(tsn);
            }
        }
        credit_newly_acked(scratch, &mut chunk);
        release_outstanding(paths, &mut chunk);
        outcome.freed_bytes += chunk.len();
        trace!("TSN {} acknowledged cumulatively", tsn);
    }
    outcome
}

/// Returns a previously gap-acknowledged chunk to the unacknowledged set.
pub(crate) fn renege_chunk(paths: &mut PathSet, chunk: &mut DataChunk) {
    debug!("Peer reneged on TSN {}", chunk.tsn);
    chunk.flags.acked = false;
    chunk.flags.reneged = true;
    chunk.flags.counted_as_newly_acked = false;
    chunk.flags.fast_retransmitted = false;
    chunk.gap_reports = 1;
    if !chunk.flags.abandoned && !chunk.flags.counts_as_outstanding {
        chunk.flags.counts_as_outstanding = true;
        if let Some(path) = chunk.last_path.and_then(|id| paths.get_mut(id)) {
            path.outstanding_bytes += chunk.len();
        }
    }
}

/// Reneges every gap-acknowledged chunk in `(from, to]`.
fn renege_above(queues: &mut OutboundQueues, paths: &mut PathSet, from: u32, to: u32) -> Vec<u32> {
    let candidates: Vec<u32> = queues
        .all()
        .filter(|c| c.flags.acked && tsn_gt(c.tsn, from) && !tsn_gt(c.tsn, to))
        .map(|c| c.tsn)
        .collect();
    for tsn in &candidates {
        if let Some(chunk) = queues.get_mut(*tsn) {
            renege_chunk(paths, chunk);
        }
    }
    candidates
}

/// Walks every TSN between the cumulative point and the last gap stop in
/// order. Reported chunks are acknowledged, holes collect miss indications.
pub(crate) fn walk_gap_reports(
    queues: &mut OutboundQueues,
    paths: &mut PathSet,
    scratch: &mut SackScratch,
    gaps: &GapList,
    sack_path: Option<PathId>,
    fast_retransmit_threshold: u32,
    now: Instant,
) -> SackOutcome {
    let mut outcome = SackOutcome::default();
    let highest = gaps.highest_tsn();
    let mut tsn = gaps.cum_ack_tsn();
    while tsn_lt(tsn, highest) {
        tsn = tsn.wrapping_add(1);
        let pending = queues.is_pending_transmission(tsn);
        let kind = gaps.kind_of(tsn);
        let Some(chunk) = queues.get_mut(tsn) else {
            continue;
        };

        if let Some(kind) = kind {
            let newly = !chunk.flags.acked;
            if newly {
                if let Some((id, path)) = cuc_for(paths, chunk) {
                    track_pseudo_cum_ack(&mut path.cuc, scratch.entry(id).or_default(), chunk, true);
                }
                if let Some(rtt) = rtt_candidate(chunk, sack_path, now) {
                    outcome.sample(rtt);
                }
                if !chunk.flags.abandoned && !chunk.flags.reneged {
                    outcome.note_new_ack(tsn);
                }
            }
            credit_newly_acked(scratch, chunk);
            release_outstanding(paths, chunk);
            if kind == AckKind::NonRevocable {
                if let Some(chunk) = queues.remove(tsn) {
                    trace!("TSN {} acknowledged non-revocably", tsn);
                    outcome.freed_bytes += chunk.len();
                }
            } else if newly {
                chunk.flags.acked = true;
                chunk.gap_reports = 0;
                if pending {
                    queues.cancel_retransmission(tsn);
                }
            }
            continue;
        }

        if chunk.flags.acked {
            renege_chunk(paths, chunk);
            outcome.reneged.push(tsn);
            continue;
        }
        if let Some((id, path)) = cuc_for(paths, chunk) {
            track_pseudo_cum_ack(&mut path.cuc, scratch.entry(id).or_default(), chunk, false);
        }
        if chunk.flags.abandoned || pending {
            continue;
        }
        chunk.gap_reports += 1;
        let last_path = chunk.last_path;
        if chunk.gap_reports >= fast_retransmit_threshold && !chunk.flags.fast_retransmitted {
            debug!(
                "Fast retransmit of TSN {} after {} miss indications",
                tsn, chunk.gap_reports
            );
            chunk.flags.fast_retransmitted = true;
            chunk.next_path = paths.retransmit_destination(last_path);
            release_outstanding(paths, chunk);
            if let Some(next) = chunk.next_path {
                scratch.entry(next).or_default().requires_rtx = true;
            }
            if let Some(id) = last_path {
                let state = scratch.entry(id).or_default();
                state.requires_rtx = true;
                if state.find_lowest_tsn {
                    state.lowest_tsn_retransmitted = true;
                }
            }
            queues.schedule_retransmission(tsn);
            outcome.fast_retransmits.push(tsn);
        }
        if let Some(id) = last_path {
            scratch.entry(id).or_default().find_lowest_tsn = false;
        }
    }
    outcome
}

impl<C: AssociationContext> Association<C> {
    pub(crate) fn on_sack(&mut self, now: Instant, inbound: &mut Inbound, sack: Sack) -> SctpResult<()> {
        let gaps = GapList::from_sack(
            sack.cum_tsn_ack,
            &sack.gap_blocks,
            &sack.nr_gap_blocks,
            sack.nr_subtract_r_gaps,
        )?;

        if self.config.check_sack_sequence {
            if let Some(sequence) = sack.sequence {
                if self.last_sack_sequence.is_some_and(|last| !tsn_gt(sequence, last)) {
                    debug!("Ignoring duplicate SACK with sequence {}", sequence);
                    return Ok(());
                }
                self.last_sack_sequence = Some(sequence);
            }
        }

        let cum = sack.cum_tsn_ack;
        if tsn_lt(cum, self.last_tsn_ack) {
            debug!(
                "Ignoring stale SACK (cum {} below {})",
                cum, self.last_tsn_ack
            );
            return Ok(());
        }
        if !tsn_lt(cum, self.next_tsn) || !tsn_lt(gaps.highest_tsn(), self.next_tsn) {
            debug!("Ignoring SACK for unsent TSNs (cum {}, next {})", cum, self.next_tsn);
            return Ok(());
        }

        let sack_path = inbound.path.or(self.paths.primary());
        let buffered_before = self.buffered_amount();
        for path in self.paths.iter_mut() {
            path.outstanding_before_sack = path.outstanding_bytes;
        }

        let mut scratch = SackScratch::new();
        let mut outcome = SackOutcome::default();
        if tsn_gt(cum, self.last_tsn_ack) {
            outcome.merge(dequeue_cumulative(
                &mut self.queues,
                &mut self.paths,
                &mut scratch,
                cum,
                sack_path,
                now,
            ));
            self.last_tsn_ack = cum;
        }
        if tsn_gt(cum, self.advanced_peer_ack_point) {
            self.advanced_peer_ack_point = cum;
        }

        // A report below an earlier gap ack means the peer dropped data it had
        // acknowledged.
        let highest_reported = gaps.highest_tsn();
        if tsn_lt(highest_reported, self.highest_tsn_acked) {
            let reneged = renege_above(
                &mut self.queues,
                &mut self.paths,
                highest_reported,
                self.highest_tsn_acked,
            );
            outcome.reneged.extend(reneged);
        }
        self.highest_tsn_acked = highest_reported;

        outcome.merge(walk_gap_reports(
            &mut self.queues,
            &mut self.paths,
            &mut scratch,
            &gaps,
            sack_path,
            self.config.fast_retransmit_threshold,
            now,
        ));

        for id in self.paths.ids() {
            if let Some(path) = self.paths.get_mut(id) {
                self.cc.on_cum_ack(path, cum);
            }
        }

        if let (Some(rtt), Some(id)) = (outcome.rtt_sample, sack_path) {
            if let Some(path) = self.paths.get_mut(id) {
                path.rto.update(rtt.as_secs_f64());
                trace!("{} RTT sample {:?}, RTO now {:?}", id, rtt, path.rto.rto());
            }
        }

        let outstanding = u32::try_from(self.outstanding_bytes()).unwrap_or(u32::MAX);
        self.peer_rwnd = sack.a_rwnd.saturating_sub(outstanding);

        let mut acked_any = false;
        for (id, state) in &scratch {
            let Some(path) = self.paths.get_mut(*id) else {
                continue;
            };
            if state.newly_acked_bytes > 0 {
                acked_any = true;
                let advanced = state.new_pseudo_cum_ack || state.new_rtx_pseudo_cum_ack;
                self.cc.on_bytes_acked(path, state.newly_acked_bytes, advanced);
            }
        }
        for (id, state) in &scratch {
            if !state.requires_rtx {
                continue;
            }
            let highest = self
                .queues
                .all()
                .filter(|c| c.last_path == Some(*id))
                .map(|c| c.tsn)
                .max_by(|a, b| a.wrapping_sub(cum).cmp(&b.wrapping_sub(cum)))
                .unwrap_or_else(|| self.next_tsn.wrapping_sub(1));
            if let Some(path) = self.paths.get_mut(*id) {
                if self.cc.on_loss_detected(path, highest) {
                    debug!("{} entered fast recovery, exit at TSN {}", id, highest);
                }
            }
        }

        for (id, state) in scratch.iter().map(|(id, s)| (*id, *s)).collect::<Vec<_>>() {
            if state.newly_acked_bytes > 0 {
                self.clear_path_errors(id);
            }
        }
        if acked_any {
            self.error_count = 0;
        }

        self.manage_retransmission_timers(&scratch, &outcome);

        if self.config.max_burst > 0 {
            for path in self.paths.iter_mut() {
                self.cc.limit_burst(path, self.config.max_burst);
            }
        }

        let buffered = self.buffered_amount();
        if buffered < buffered_before {
            let limit = self.config.send_queue_limit;
            if limit == 0 || buffered < limit {
                self.ctx.indicate(Indication::SendQueueAbated {
                    queued: buffered,
                    available: if limit == 0 { usize::MAX } else { limit - buffered },
                });
            }
        }

        self.advance_peer_ack_point(true);
        self.check_shutdown_progress();
        self.flush_deferred_incoming_reset();
        self.flush_deferred_tsn_reset();
        inbound.transmit = true;
        Ok(())
    }

    fn manage_retransmission_timers(&mut self, scratch: &SackScratch, outcome: &SackOutcome) {
        for id in self.paths.ids() {
            let Some(path) = self.paths.get(id) else {
                continue;
            };
            let rto = path.rto.rto();
            let idle = path.outstanding_bytes == 0 && self.queues.queued_bytes_for(id) == 0;
            let state = scratch.get(&id).copied().unwrap_or_default();
            if idle {
                self.timers.stop(&mut self.ctx, TimerId::Retransmission(id));
            } else if state.new_cum_ack || state.lowest_tsn_retransmitted {
                self.timers.start(&mut self.ctx, TimerId::Retransmission(id), rto);
            }
        }
        for tsn in &outcome.reneged {
            let Some(id) = self.queues.get(*tsn).and_then(|c| c.last_path) else {
                continue;
            };
            let timer = TimerId::Retransmission(id);
            if !self.timers.is_running(timer) {
                if let Some(path) = self.paths.get(id) {
                    let rto = path.rto.rto();
                    self.timers.start(&mut self.ctx, timer, rto);
                }
            }
        }
    }

    /// Resets error counters after acknowledged traffic on `id`, reactivating
    /// the path if needed.
    pub(crate) fn clear_path_errors(&mut self, id: PathId) {
        let Some(path) = self.paths.get_mut(id) else {
            return;
        };
        path.error_count = 0;
        if !path.active {
            path.active = true;
            let remote = path.remote;
            debug!("{} ({}) is active again", id, remote);
            self.ctx.indicate(Indication::PathStatus { remote, active: true });
            if self.config.reactivate_primary_path
                && self.paths.initial_primary() == Some(id)
                && self.paths.primary() != Some(id)
            {
                self.paths.set_primary(id);
                self.ctx.indicate(Indication::PrimaryChanged(remote));
            }
        }
    }

    /// Shutdown paths treat the cumulative ack of SHUTDOWN like a SACK.
    pub(crate) fn on_cumulative_ack(&mut self, now: Instant, inbound: &mut Inbound, cum: u32) {
        if !tsn_gt(cum, self.last_tsn_ack) || self.state == AssociationState::Closed {
            return;
        }
        let sack = Sack {
            cum_tsn_ack: cum,
            a_rwnd: self
                .peer_rwnd
                .saturating_add(u32::try_from(self.outstanding_bytes()).unwrap_or(u32::MAX)),
            ..Default::default()
        };
        if let Err(e) = self.on_sack(now, inbound, sack) {
            debug!("Ignoring cumulative ack {}: {}", cum, e);
        }
    }
}
