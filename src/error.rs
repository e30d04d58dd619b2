use crate::association::AssociationState;
use thiserror::Error;

pub type SctpResult<T> = Result<T, SctpError>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SctpError {
    #[error("packet too short: {0} bytes")]
    PacketTooShort(usize),
    #[error("checksum mismatch: received {received:#010x}, calculated {calculated:#010x}")]
    ChecksumMismatch { received: u32, calculated: u32 },
    #[error("malformed {0} chunk")]
    MalformedChunk(&'static str),
    #[error("malformed gap list: {0}")]
    MalformedGapList(&'static str),
    #[error("stream {0} does not exist")]
    InvalidStream(u16),
    #[error("send queue full: {queued} of {limit} bytes in use")]
    SendQueueFull { queued: usize, limit: usize },
    #[error("operation not allowed in state {0:?}")]
    InvalidState(AssociationState),
    #[error("stream reconfiguration request {0} is still outstanding")]
    ResetInProgress(u32),
    #[error("no path to {0}")]
    UnknownPath(std::net::SocketAddr),
    #[error("cannot remove the last remaining path")]
    LastPath,
    #[error("empty user message")]
    EmptyMessage,
    #[error("stream count would exceed 65535")]
    TooManyStreams,
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}
