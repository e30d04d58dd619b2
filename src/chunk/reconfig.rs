//! RE-CONFIG parameters (RFC 6525).

use super::put_param;
use anyhow::{Result, ensure};
use bytes::{Buf, BufMut, Bytes, BytesMut};

// Reconfig Parameter Types
const RECONFIG_PARAM_OUTGOING_SSN_RESET: u16 = 13;
const RECONFIG_PARAM_INCOMING_SSN_RESET: u16 = 14;
const RECONFIG_PARAM_SSN_TSN_RESET: u16 = 15;
const RECONFIG_PARAM_RESPONSE: u16 = 16;
const RECONFIG_PARAM_ADD_OUTGOING_STREAMS: u16 = 17;
const RECONFIG_PARAM_ADD_INCOMING_STREAMS: u16 = 18;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ReconfigResult {
    NothingToDo = 0,
    Performed = 1,
    Denied = 2,
    WrongSsn = 3,
    RequestInProgress = 4,
    /// Bad request sequence number: the request was not performed.
    NoReset = 5,
    Deferred = 6,
}

impl ReconfigResult {
    pub fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            0 => Self::NothingToDo,
            1 => Self::Performed,
            2 => Self::Denied,
            3 => Self::WrongSsn,
            4 => Self::RequestInProgress,
            5 => Self::NoReset,
            6 => Self::Deferred,
            _ => return None,
        })
    }

    pub fn is_success(self) -> bool {
        matches!(self, Self::NothingToDo | Self::Performed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconfigParam {
    OutgoingReset {
        request_sn: u32,
        /// Sequence number of the peer request this one answers, if any.
        response_sn: u32,
        /// Last TSN assigned by the sender before the reset.
        last_tsn: u32,
        /// Empty means every stream.
        streams: Vec<u16>,
    },
    IncomingReset {
        request_sn: u32,
        streams: Vec<u16>,
    },
    /// Reset every stream in both directions and restart both TSN spaces.
    SsnTsnReset {
        request_sn: u32,
    },
    Response {
        response_sn: u32,
        result: ReconfigResult,
        /// Sender's and receiver's next TSN, present when an SSN/TSN reset
        /// was performed.
        next_tsns: Option<(u32, u32)>,
    },
    AddOutgoingStreams {
        request_sn: u32,
        count: u16,
    },
    AddIncomingStreams {
        request_sn: u32,
        count: u16,
    },
}

impl ReconfigParam {
    pub fn param_type(&self) -> u16 {
        match self {
            Self::OutgoingReset { .. } => RECONFIG_PARAM_OUTGOING_SSN_RESET,
            Self::IncomingReset { .. } => RECONFIG_PARAM_INCOMING_SSN_RESET,
            Self::SsnTsnReset { .. } => RECONFIG_PARAM_SSN_TSN_RESET,
            Self::Response { .. } => RECONFIG_PARAM_RESPONSE,
            Self::AddOutgoingStreams { .. } => RECONFIG_PARAM_ADD_OUTGOING_STREAMS,
            Self::AddIncomingStreams { .. } => RECONFIG_PARAM_ADD_INCOMING_STREAMS,
        }
    }

    /// Request sequence number, `None` for responses.
    pub fn request_sn(&self) -> Option<u32> {
        match self {
            Self::OutgoingReset { request_sn, .. }
            | Self::IncomingReset { request_sn, .. }
            | Self::SsnTsnReset { request_sn }
            | Self::AddOutgoingStreams { request_sn, .. }
            | Self::AddIncomingStreams { request_sn, .. } => Some(*request_sn),
            Self::Response { .. } => None,
        }
    }

    pub(crate) fn encode(&self, buf: &mut BytesMut) {
        let mut value = BytesMut::new();
        match self {
            Self::OutgoingReset {
                request_sn,
                response_sn,
                last_tsn,
                streams,
            } => {
                value.put_u32(*request_sn);
                value.put_u32(*response_sn);
                value.put_u32(*last_tsn);
                for sid in streams {
                    value.put_u16(*sid);
                }
            }
            Self::IncomingReset {
                request_sn,
                streams,
            } => {
                value.put_u32(*request_sn);
                for sid in streams {
                    value.put_u16(*sid);
                }
            }
            Self::SsnTsnReset { request_sn } => value.put_u32(*request_sn),
            Self::Response {
                response_sn,
                result,
                next_tsns,
            } => {
                value.put_u32(*response_sn);
                value.put_u32(*result as u32);
                if let Some((sender_next, receiver_next)) = next_tsns {
                    value.put_u32(*sender_next);
                    value.put_u32(*receiver_next);
                }
            }
            Self::AddOutgoingStreams { request_sn, count }
            | Self::AddIncomingStreams { request_sn, count } => {
                value.put_u32(*request_sn);
                value.put_u16(*count);
                value.put_u16(0);
            }
        }
        put_param(buf, self.param_type(), &value);
    }

    pub(crate) fn decode(kind: u16, mut buf: Bytes) -> Result<Option<Self>> {
        let param = match kind {
            RECONFIG_PARAM_OUTGOING_SSN_RESET => {
                ensure!(buf.remaining() >= 12, "outgoing reset parameter too short");
                let request_sn = buf.get_u32();
                let response_sn = buf.get_u32();
                let last_tsn = buf.get_u32();
                Self::OutgoingReset {
                    request_sn,
                    response_sn,
                    last_tsn,
                    streams: decode_streams(buf),
                }
            }
            RECONFIG_PARAM_INCOMING_SSN_RESET => {
                ensure!(buf.remaining() >= 4, "incoming reset parameter too short");
                let request_sn = buf.get_u32();
                Self::IncomingReset {
                    request_sn,
                    streams: decode_streams(buf),
                }
            }
            RECONFIG_PARAM_RESPONSE => {
                ensure!(buf.remaining() >= 8, "response parameter too short");
                let response_sn = buf.get_u32();
                let code = buf.get_u32();
                let Some(result) = ReconfigResult::from_code(code) else {
                    anyhow::bail!("unknown reconfiguration result {}", code);
                };
                let next_tsns = (buf.remaining() >= 8).then(|| (buf.get_u32(), buf.get_u32()));
                Self::Response {
                    response_sn,
                    result,
                    next_tsns,
                }
            }
            RECONFIG_PARAM_SSN_TSN_RESET => {
                ensure!(buf.remaining() >= 4, "SSN/TSN reset parameter too short");
                Self::SsnTsnReset {
                    request_sn: buf.get_u32(),
                }
            }
            RECONFIG_PARAM_ADD_OUTGOING_STREAMS | RECONFIG_PARAM_ADD_INCOMING_STREAMS => {
                ensure!(buf.remaining() >= 8, "add streams parameter too short");
                let request_sn = buf.get_u32();
                let count = buf.get_u16();
                if kind == RECONFIG_PARAM_ADD_OUTGOING_STREAMS {
                    Self::AddOutgoingStreams { request_sn, count }
                } else {
                    Self::AddIncomingStreams { request_sn, count }
                }
            }
            _ => return Ok(None),
        };
        Ok(Some(param))
    }
}

fn decode_streams(mut buf: Bytes) -> Vec<u16> {
    let mut streams = Vec::with_capacity(buf.remaining() / 2);
    while buf.remaining() >= 2 {
        streams.push(buf.get_u16());
    }
    streams
}
