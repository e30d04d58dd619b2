//! Timer expiries, path liveness and error accounting.

use super::sack::release_outstanding;
use super::Association;
use crate::chunk::Chunk;
use crate::context::{AssociationContext, ConnectionLossReason, Indication};
use crate::error::{SctpError, SctpResult};
use crate::path::{HeartbeatProbe, PathId};
use crate::timer::TimerId;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::time::Instant;
use tracing::{debug, trace, warn};

impl<C: AssociationContext> Association<C> {
    /// Entry point for an expired timer previously requested through
    /// [`AssociationContext::schedule_timer`].
    pub fn handle_timeout(&mut self, now: Instant, timer: TimerId) {
        if !self.timers.expire(timer) {
            trace!("Ignoring stale {:?}", timer);
            return;
        }
        match timer {
            TimerId::Init => self.on_init_timeout(),
            TimerId::Shutdown => self.on_shutdown_timeout(),
            TimerId::Retransmission(id) => self.on_retransmission_timeout(now, id),
            TimerId::Heartbeat(id) => self.on_heartbeat_timeout(now, id),
            TimerId::StreamReset => self.on_reset_timeout(),
            TimerId::DelayedSack => {
                if self.state != super::AssociationState::Closed {
                    self.send_sack();
                }
            }
        }
    }

    /// Counts a failure against the association and against `id`. Returns
    /// false if the association was torn down.
    pub(crate) fn record_path_error(&mut self, id: Option<PathId>) -> bool {
        self.error_count += 1;
        if self.error_count > self.config.max_association_retransmits {
            warn!(
                "Association error count {} exceeded limit {}",
                self.error_count, self.config.max_association_retransmits
            );
            self.connection_lost(ConnectionLossReason::RetransmissionLimit);
            return false;
        }
        let Some(path) = id.and_then(|id| self.paths.get_mut(id)) else {
            return true;
        };
        path.error_count += 1;
        if path.error_count > self.config.max_path_retransmits && path.active {
            path.active = false;
            let (remote, pid) = (path.remote, path.id);
            debug!("{} ({}) marked inactive after {} errors", pid, remote, path.error_count);
            self.ctx.indicate(Indication::PathStatus { remote, active: false });
            if let Some(primary) = self.paths.failover() {
                if let Some(p) = self.paths.get(primary) {
                    debug!("Primary path failed over to {}", primary);
                    let remote = p.remote;
                    self.ctx.indicate(Indication::PrimaryChanged(remote));
                }
            }
            if self.paths.active_count() == 0 {
                self.connection_lost(ConnectionLossReason::NoActivePath);
                return false;
            }
        }
        true
    }

    fn on_retransmission_timeout(&mut self, now: Instant, id: PathId) {
        if !self.state.carries_data() && self.state != super::AssociationState::ShutdownSent {
            return;
        }
        let Some(path) = self.paths.get_mut(id) else {
            return;
        };
        path.rto.backoff();
        self.cc.on_retransmission_timeout(path);
        debug!(
            "T3-rtx expired on {} (RTO now {:?}, cwnd {})",
            id,
            path.rto.rto(),
            path.cwnd
        );
        if !self.record_path_error(Some(id)) {
            return;
        }

        let destination = self.paths.retransmit_destination(Some(id));
        let expired: Vec<u32> = self
            .queues
            .all()
            .filter(|c| {
                !c.flags.acked
                    && !c.flags.abandoned
                    && (c.last_path == Some(id) || c.next_path == Some(id))
            })
            .map(|c| c.tsn)
            .collect();
        let mut moved = 0;
        for tsn in expired {
            let pending = self.queues.is_pending_transmission(tsn);
            let Some(chunk) = self.queues.get_mut(tsn) else {
                continue;
            };
            chunk.next_path = destination;
            if pending {
                continue;
            }
            chunk.flags.timer_retransmitted = true;
            chunk.flags.fast_retransmitted = false;
            chunk.gap_reports = 0;
            if destination != Some(id) {
                chunk.flags.moved = true;
            }
            if chunk.flags.counts_as_outstanding {
                self.peer_rwnd = self.peer_rwnd.saturating_add(chunk.len() as u32);
            }
            release_outstanding(&mut self.paths, chunk);
            self.queues.schedule_retransmission(tsn);
            moved += 1;
        }
        if moved > 0 {
            debug!("Requeued {} chunk(s) from {} for {:?}", moved, id, destination);
        }
        self.advance_peer_ack_point(true);
        self.transmit(now);
    }

    pub(crate) fn start_heartbeats(&mut self, now: Instant) {
        for id in self.paths.ids() {
            self.start_heartbeat(now, id);
        }
    }

    pub(crate) fn start_heartbeat(&mut self, _now: Instant, id: PathId) {
        let Some(interval) = self.config.heartbeat_interval else {
            return;
        };
        let Some(path) = self.paths.get(id) else {
            return;
        };
        let after = interval + path.rto.rto();
        self.timers.start(&mut self.ctx, TimerId::Heartbeat(id), after);
    }

    fn on_heartbeat_timeout(&mut self, now: Instant, id: PathId) {
        if !self.state.carries_data() {
            return;
        }
        let unanswered = match self.paths.get_mut(id) {
            Some(path) if path.heartbeat.is_some() => {
                path.rto.backoff();
                true
            }
            Some(_) => false,
            None => return,
        };
        if unanswered {
            debug!("HEARTBEAT on {} unanswered", id);
            if !self.record_path_error(Some(id)) {
                return;
            }
        }
        let Some(path) = self.paths.get_mut(id) else {
            return;
        };
        let rto = path.rto.rto();
        let idle = path.outstanding_bytes == 0
            && path.last_send.is_none_or(|sent| now.saturating_duration_since(sent) > rto);
        if idle {
            self.cc.on_idle(path);
        }
        self.heartbeat_nonce = self.heartbeat_nonce.wrapping_add(1);
        let nonce = self.heartbeat_nonce;
        path.heartbeat = Some(HeartbeatProbe { nonce, sent: now });
        let mut info = BytesMut::with_capacity(8);
        info.put_u64(nonce);
        self.send_to_path(id, Chunk::Heartbeat { info: info.freeze() });
        self.start_heartbeat(now, id);
    }

    pub(crate) fn on_heartbeat_ack(&mut self, now: Instant, mut info: Bytes) -> SctpResult<()> {
        if info.remaining() < 8 {
            return Err(SctpError::MalformedChunk("HEARTBEAT ACK"));
        }
        let nonce = info.get_u64();
        let Some(id) = self
            .paths
            .iter()
            .find(|p| p.heartbeat.is_some_and(|probe| probe.nonce == nonce))
            .map(|p| p.id)
        else {
            trace!("HEARTBEAT ACK with unknown nonce {}", nonce);
            return Ok(());
        };
        if let Some(path) = self.paths.get_mut(id) {
            if let Some(probe) = path.heartbeat.take() {
                let rtt = now.saturating_duration_since(probe.sent);
                path.rto.update(rtt.as_secs_f64());
                trace!("{} heartbeat RTT {:?}", id, rtt);
            }
            path.confirmed = true;
        }
        self.error_count = 0;
        self.clear_path_errors(id);
        Ok(())
    }
}
