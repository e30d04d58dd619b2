//! The boundary between an [`Association`](crate::Association) and its
//! embedder.

use crate::chunk::{Chunk, ReconfigResult};
use crate::timer::TimerId;
use bytes::Bytes;
use std::net::SocketAddr;
use std::time::Duration;

/// Everything the association needs from the outside world. All calls are
/// made synchronously from within association methods.
pub trait AssociationContext {
    fn send(&mut self, chunk: Chunk, destination: SocketAddr);
    fn schedule_timer(&mut self, timer: TimerId, after: Duration);
    fn cancel_timer(&mut self, timer: TimerId);
    fn deliver(&mut self, message: Message);
    fn indicate(&mut self, indication: Indication);
}

/// A reassembled user message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub stream_id: u16,
    pub stream_seq: u16,
    pub ppid: u32,
    pub unordered: bool,
    pub payload: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionLossReason {
    /// Association-wide retransmission threshold exceeded.
    RetransmissionLimit,
    /// Every destination is inactive.
    NoActivePath,
    InitTimeout,
    ShutdownTimeout,
    PeerAbort,
    ProtocolViolation,
    UserAbort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetDirection {
    /// Our sending streams were reset.
    Outgoing,
    /// Our receiving streams were reset.
    Incoming,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Indication {
    CommunicationUp,
    ConnectionLost(ConnectionLossReason),
    AddressAdded(SocketAddr),
    AddressRemoved(SocketAddr),
    PathStatus { remote: SocketAddr, active: bool },
    PrimaryChanged(SocketAddr),
    /// Unsent and unacknowledged data fell after an acknowledgment.
    SendQueueAbated { queued: usize, available: usize },
    ResetCompleted { streams: Vec<u16>, direction: ResetDirection },
    ResetFailed { request_sn: u32, result: ReconfigResult },
    StreamsAdded { inbound: u16, outbound: u16 },
    ShutdownReceived,
    Closed,
}

/// A recorded context call.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Send { chunk: Chunk, destination: SocketAddr },
    ScheduleTimer { timer: TimerId, after: Duration },
    CancelTimer(TimerId),
    Deliver(Message),
    Indicate(Indication),
}

/// Context that buffers every call for the embedder to process later.
#[derive(Debug, Default)]
pub struct ActionQueue {
    actions: Vec<Action>,
}

impl ActionQueue {
    pub fn drain(&mut self) -> std::vec::Drain<'_, Action> {
        self.actions.drain(..)
    }

    pub fn actions(&self) -> &[Action] {
        &self.actions
    }

    pub fn clear(&mut self) {
        self.actions.clear();
    }

    pub fn sent(&self) -> impl Iterator<Item = (&Chunk, SocketAddr)> {
        self.actions.iter().filter_map(|a| match a {
            Action::Send { chunk, destination } => Some((chunk, *destination)),
            _ => None,
        })
    }

    pub fn indications(&self) -> impl Iterator<Item = &Indication> {
        self.actions.iter().filter_map(|a| match a {
            Action::Indicate(i) => Some(i),
            _ => None,
        })
    }

    pub fn delivered(&self) -> impl Iterator<Item = &Message> {
        self.actions.iter().filter_map(|a| match a {
            Action::Deliver(m) => Some(m),
            _ => None,
        })
    }
}

impl AssociationContext for ActionQueue {
    fn send(&mut self, chunk: Chunk, destination: SocketAddr) {
        self.actions.push(Action::Send { chunk, destination });
    }

    fn schedule_timer(&mut self, timer: TimerId, after: Duration) {
        self.actions.push(Action::ScheduleTimer { timer, after });
    }

    fn cancel_timer(&mut self, timer: TimerId) {
        self.actions.push(Action::CancelTimer(timer));
    }

    fn deliver(&mut self, message: Message) {
        self.actions.push(Action::Deliver(message));
    }

    fn indicate(&mut self, indication: Indication) {
        self.actions.push(Action::Indicate(indication));
    }
}
