//! Graceful shutdown: SHUTDOWN, SHUTDOWN ACK and SHUTDOWN COMPLETE.

use super::{Association, AssociationState, Inbound};
use crate::chunk::Chunk;
use crate::context::{AssociationContext, ConnectionLossReason, Indication};
use crate::error::{SctpError, SctpResult};
use crate::timer::TimerId;
use std::time::Instant;
use tracing::debug;

impl<C: AssociationContext> Association<C> {
    /// Starts a graceful shutdown. Queued data is still delivered before the
    /// SHUTDOWN goes out.
    pub fn shutdown(&mut self, _now: Instant) -> SctpResult<()> {
        match self.state {
            AssociationState::Established => {
                self.set_state(AssociationState::ShutdownPending);
                self.check_shutdown_progress();
                Ok(())
            }
            AssociationState::CookieWait | AssociationState::CookieEchoed => {
                self.teardown();
                self.ctx.indicate(Indication::Closed);
                Ok(())
            }
            AssociationState::Closed => Err(SctpError::InvalidState(self.state)),
            _ => Ok(()),
        }
    }

    fn all_data_acknowledged(&self) -> bool {
        self.queues.is_empty() && self.streams.queued_bytes() == 0
    }

    /// Sends SHUTDOWN or SHUTDOWN ACK once everything we sent is acknowledged.
    pub(crate) fn check_shutdown_progress(&mut self) {
        let next = match self.state {
            AssociationState::ShutdownPending => AssociationState::ShutdownSent,
            AssociationState::ShutdownReceived => AssociationState::ShutdownAckSent,
            _ => return,
        };
        if !self.all_data_acknowledged() {
            return;
        }
        for id in self.paths.ids() {
            self.timers.stop(&mut self.ctx, TimerId::Retransmission(id));
        }
        self.shutdown_path = self.paths.primary();
        self.set_state(next);
        self.send_shutdown_chunk();
    }

    fn send_shutdown_chunk(&mut self) {
        let Some(id) = self.shutdown_path else {
            return;
        };
        let chunk = match self.state {
            AssociationState::ShutdownSent => Chunk::Shutdown {
                cum_tsn_ack: self.received.cum_ack_tsn(),
            },
            AssociationState::ShutdownAckSent => Chunk::ShutdownAck,
            _ => return,
        };
        self.send_to_path(id, chunk);
        let rto = self
            .paths
            .get(id)
            .map(|p| p.rto.rto())
            .unwrap_or(self.config.rto_initial);
        self.timers.start(&mut self.ctx, TimerId::Shutdown, rto);
    }

    pub(crate) fn on_shutdown(&mut self, now: Instant, inbound: &mut Inbound, cum_tsn_ack: u32) -> SctpResult<()> {
        match self.state {
            AssociationState::Established | AssociationState::ShutdownPending => {
                self.on_cumulative_ack(now, inbound, cum_tsn_ack);
                self.set_state(AssociationState::ShutdownReceived);
                self.ctx.indicate(Indication::ShutdownReceived);
                self.check_shutdown_progress();
            }
            AssociationState::ShutdownSent => {
                // Both sides started shutting down.
                self.on_cumulative_ack(now, inbound, cum_tsn_ack);
                self.set_state(AssociationState::ShutdownAckSent);
                self.send_shutdown_chunk();
            }
            AssociationState::ShutdownReceived => {
                self.on_cumulative_ack(now, inbound, cum_tsn_ack);
                self.check_shutdown_progress();
            }
            state => debug!("Ignoring SHUTDOWN in state {:?}", state),
        }
        Ok(())
    }

    pub(crate) fn on_shutdown_ack(&mut self, inbound: &mut Inbound) -> SctpResult<()> {
        match self.state {
            AssociationState::ShutdownSent | AssociationState::ShutdownAckSent => {
                self.send_to_primary(Chunk::ShutdownComplete { reflected: false });
                self.teardown();
                self.ctx.indicate(Indication::Closed);
                inbound.stop = true;
            }
            AssociationState::Closed | AssociationState::CookieWait | AssociationState::CookieEchoed => {
                // Out of the blue: the peer still thinks we exist.
                self.ctx
                    .send(Chunk::ShutdownComplete { reflected: true }, inbound.source);
            }
            state => debug!("Ignoring SHUTDOWN ACK in state {:?}", state),
        }
        Ok(())
    }

    pub(crate) fn on_shutdown_complete(&mut self) -> SctpResult<()> {
        if self.state == AssociationState::ShutdownAckSent {
            self.teardown();
            self.ctx.indicate(Indication::Closed);
        }
        Ok(())
    }

    pub(crate) fn on_shutdown_timeout(&mut self) {
        if !matches!(
            self.state,
            AssociationState::ShutdownSent | AssociationState::ShutdownAckSent
        ) {
            return;
        }
        let current = self.shutdown_path;
        if let Some(path) = current.and_then(|id| self.paths.get_mut(id)) {
            path.rto.backoff();
        }
        self.error_count += 1;
        if self.error_count > self.config.max_association_retransmits {
            self.connection_lost(ConnectionLossReason::ShutdownTimeout);
            return;
        }
        if let Some(id) = current {
            if let Some(path) = self.paths.get_mut(id) {
                path.error_count += 1;
            }
        }
        self.shutdown_path = self.paths.retransmit_destination(current);
        debug!("T2-shutdown expired, resending on {:?}", self.shutdown_path);
        self.send_shutdown_chunk();
    }
}
