//! A callback-driven SCTP association engine.
//!
//! The [`Association`] owns all protocol state for one peer: outstanding data,
//! per-destination congestion and retransmission state, receive-side gap
//! tracking and the stream reconfiguration negotiator. It performs no I/O of its
//! own; every effect (sending a chunk, arming a timer, delivering a message) goes
//! through an [`AssociationContext`] supplied by the embedder. [`driver`] contains
//! a tokio-based runner that wires an association to a datagram transport.

pub mod association;
pub mod chunk;
pub mod config;
pub mod congestion;
pub mod context;
pub mod driver;
pub mod error;
pub mod gap_list;
pub mod path;
pub mod queue;
pub mod stream;
pub mod timer;
pub mod tsn;

pub use association::{Association, AssociationState};
pub use chunk::{Chunk, ChunkType, packet::Packet};
pub use config::SctpConfig;
pub use context::{
    Action, ActionQueue, AssociationContext, ConnectionLossReason, Indication, Message,
    ResetDirection,
};
pub use error::{SctpError, SctpResult};
pub use path::PathId;
pub use stream::OutgoingMessage;
pub use timer::TimerId;
