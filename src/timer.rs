//! Timer identities and the set of currently armed timers.
//!
//! Timers are owned by the embedder: the association asks for one through
//! [`AssociationContext::schedule_timer`] and later receives
//! [`Association::handle_timeout`](crate::Association::handle_timeout) with the
//! same [`TimerId`]. Each identity is armed at most once; re-arming cancels the
//! previous instance first.

use crate::context::AssociationContext;
use crate::path::PathId;
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TimerId {
    /// T1: INIT or COOKIE ECHO retransmission.
    Init,
    /// T2: SHUTDOWN or SHUTDOWN ACK retransmission.
    Shutdown,
    /// T3-rtx for one destination.
    Retransmission(PathId),
    Heartbeat(PathId),
    /// Outstanding RE-CONFIG request.
    StreamReset,
    DelayedSack,
}

#[derive(Debug, Default)]
pub(crate) struct Timers {
    armed: BTreeSet<TimerId>,
}

impl Timers {
    pub(crate) fn start<C: AssociationContext>(&mut self, ctx: &mut C, timer: TimerId, after: Duration) {
        if self.armed.contains(&timer) {
            ctx.cancel_timer(timer);
        }
        trace!("Arming {:?} for {:?}", timer, after);
        self.armed.insert(timer);
        ctx.schedule_timer(timer, after);
    }

    pub(crate) fn stop<C: AssociationContext>(&mut self, ctx: &mut C, timer: TimerId) {
        if self.armed.remove(&timer) {
            ctx.cancel_timer(timer);
        }
    }

    pub(crate) fn is_running(&self, timer: TimerId) -> bool {
        self.armed.contains(&timer)
    }

    /// Consumes an expiry. Returns false for timers that were not armed, which
    /// callers must ignore.
    pub(crate) fn expire(&mut self, timer: TimerId) -> bool {
        self.armed.remove(&timer)
    }

    pub(crate) fn stop_all<C: AssociationContext>(&mut self, ctx: &mut C) {
        for timer in std::mem::take(&mut self.armed) {
            ctx.cancel_timer(timer);
        }
    }

    /// Disarms every timer bound to `path`.
    pub(crate) fn stop_path<C: AssociationContext>(&mut self, ctx: &mut C, path: PathId) {
        self.stop(ctx, TimerId::Retransmission(path));
        self.stop(ctx, TimerId::Heartbeat(path));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{Action, ActionQueue};

    #[test]
    fn test_restart_cancels_previous_instance() {
        let mut ctx = ActionQueue::default();
        let mut timers = Timers::default();
        let t3 = TimerId::Retransmission(PathId(0));

        timers.start(&mut ctx, t3, Duration::from_secs(1));
        timers.start(&mut ctx, t3, Duration::from_secs(2));
        assert_eq!(
            ctx.drain().collect::<Vec<_>>(),
            vec![
                Action::ScheduleTimer { timer: t3, after: Duration::from_secs(1) },
                Action::CancelTimer(t3),
                Action::ScheduleTimer { timer: t3, after: Duration::from_secs(2) },
            ]
        );
    }

    #[test]
    fn test_stale_expiry_is_ignored() {
        let mut ctx = ActionQueue::default();
        let mut timers = Timers::default();
        timers.start(&mut ctx, TimerId::DelayedSack, Duration::from_millis(200));
        timers.stop(&mut ctx, TimerId::DelayedSack);
        assert!(!timers.expire(TimerId::DelayedSack));
        assert!(!timers.is_running(TimerId::DelayedSack));
    }
}
