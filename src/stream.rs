//! Outgoing stream queues with fragmentation and round-robin scheduling, and
//! incoming reassembly with ordered delivery.

use crate::chunk::Data;
use crate::context::Message;
use crate::error::{SctpError, SctpResult};
use crate::tsn::{ssn_gt, tsn_gt, tsn_le};
use bytes::{Bytes, BytesMut};
use std::collections::{BTreeMap, VecDeque};
use tracing::{debug, trace};

/// A user message handed to [`Association::send`](crate::Association::send).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub stream_id: u16,
    pub ppid: u32,
    pub payload: Bytes,
    pub unordered: bool,
    /// PR-SCTP: abandon after this many retransmissions. `None` is reliable.
    pub max_retransmissions: Option<u32>,
}

impl OutgoingMessage {
    pub fn new(stream_id: u16, payload: impl Into<Bytes>) -> Self {
        Self {
            stream_id,
            ppid: 0,
            payload: payload.into(),
            unordered: false,
            max_retransmissions: None,
        }
    }

    pub fn with_ppid(mut self, ppid: u32) -> Self {
        self.ppid = ppid;
        self
    }

    pub fn unordered(mut self) -> Self {
        self.unordered = true;
        self
    }

    pub fn with_max_retransmissions(mut self, max: u32) -> Self {
        self.max_retransmissions = Some(max);
        self
    }
}

/// One DATA chunk worth of a message, ready for TSN assignment.
#[derive(Debug, Clone)]
pub(crate) struct Fragment {
    pub(crate) stream_id: u16,
    pub(crate) stream_seq: u16,
    pub(crate) ppid: u32,
    pub(crate) unordered: bool,
    pub(crate) beginning: bool,
    pub(crate) ending: bool,
    pub(crate) payload: Bytes,
    pub(crate) max_retransmissions: Option<u32>,
}

#[derive(Debug)]
struct PendingMessage {
    ppid: u32,
    unordered: bool,
    max_retransmissions: Option<u32>,
    pieces: VecDeque<Bytes>,
    /// Assigned when the first fragment leaves, so a stream reset that
    /// completes while the message is queued renumbers it.
    ssn: Option<u16>,
}

#[derive(Debug, Default)]
struct SendStream {
    next_ssn: u16,
    queue: VecDeque<PendingMessage>,
    queued_bytes: usize,
    reset_pending: bool,
}

impl SendStream {
    fn in_progress(&self) -> bool {
        self.queue.front().is_some_and(|m| m.ssn.is_some())
    }
}

#[derive(Debug, Default)]
struct ReceiveStream {
    expected_ssn: u16,
    fragments: BTreeMap<u32, Data>,
    buffered_bytes: usize,
}

impl ReceiveStream {
    /// Pulls every message that is complete and, for ordered messages, next in
    /// sequence.
    fn deliverable(&mut self, stream_id: u16) -> Vec<(Message, Vec<u32>)> {
        let mut out = Vec::new();
        while let Some(tsns) = self.next_complete() {
            let parts: Vec<Data> = tsns
                .iter()
                .filter_map(|tsn| self.fragments.remove(tsn))
                .collect();
            let Some(first) = parts.first() else {
                break;
            };
            let (ppid, stream_seq, unordered) = (first.ppid, first.stream_seq, first.unordered);
            let total: usize = parts.iter().map(|p| p.payload.len()).sum();
            let payload = if parts.len() == 1 {
                parts[0].payload.clone()
            } else {
                let mut buf = BytesMut::with_capacity(total);
                for part in &parts {
                    buf.extend_from_slice(&part.payload);
                }
                buf.freeze()
            };
            self.buffered_bytes = self.buffered_bytes.saturating_sub(total);
            if !unordered {
                self.expected_ssn = self.expected_ssn.wrapping_add(1);
            }
            out.push((
                Message {
                    stream_id,
                    stream_seq,
                    ppid,
                    unordered,
                    payload,
                },
                tsns,
            ));
        }
        out
    }

    fn next_complete(&self) -> Option<Vec<u32>> {
        for (&tsn, first) in &self.fragments {
            if !first.beginning || (!first.unordered && first.stream_seq != self.expected_ssn) {
                continue;
            }
            let mut tsns = vec![tsn];
            let mut current = first;
            let mut next_tsn = tsn;
            let complete = loop {
                if current.ending {
                    break true;
                }
                next_tsn = next_tsn.wrapping_add(1);
                match self.fragments.get(&next_tsn) {
                    Some(next)
                        if !next.beginning
                            && next.unordered == first.unordered
                            && (first.unordered || next.stream_seq == first.stream_seq) =>
                    {
                        tsns.push(next_tsn);
                        current = next;
                    }
                    _ => break false,
                }
            };
            if complete {
                return Some(tsns);
            }
        }
        None
    }
}

/// All streams of one association in both directions.
#[derive(Debug)]
pub struct StreamEngine {
    send: Vec<SendStream>,
    receive: Vec<ReceiveStream>,
    cursor: usize,
    current: Option<u16>,
    queued_bytes: usize,
}

impl StreamEngine {
    pub fn new(outbound: u16, inbound: u16) -> Self {
        Self {
            send: (0..outbound).map(|_| SendStream::default()).collect(),
            receive: (0..inbound).map(|_| ReceiveStream::default()).collect(),
            cursor: 0,
            current: None,
            queued_bytes: 0,
        }
    }

    pub fn outbound_count(&self) -> u16 {
        self.send.len() as u16
    }

    pub fn inbound_count(&self) -> u16 {
        self.receive.len() as u16
    }

    /// Renegotiated stream counts after the handshake; existing state is kept.
    pub(crate) fn resize(&mut self, outbound: u16, inbound: u16) {
        self.send.resize_with(outbound as usize, SendStream::default);
        self.receive.resize_with(inbound as usize, ReceiveStream::default);
        if self.current.is_some_and(|sid| sid >= outbound) {
            self.current = None;
        }
    }

    pub(crate) fn add_outbound(&mut self, count: u16) {
        let total = self.send.len() + count as usize;
        self.send.resize_with(total, SendStream::default);
    }

    pub(crate) fn add_inbound(&mut self, count: u16) {
        let total = self.receive.len() + count as usize;
        self.receive.resize_with(total, ReceiveStream::default);
    }

    pub(crate) fn enqueue(&mut self, message: OutgoingMessage, max_payload: usize) -> SctpResult<()> {
        let Some(stream) = self.send.get_mut(message.stream_id as usize) else {
            return Err(SctpError::InvalidStream(message.stream_id));
        };
        if message.payload.is_empty() {
            return Err(SctpError::EmptyMessage);
        }
        let mut pieces = VecDeque::new();
        let mut rest = message.payload;
        while rest.len() > max_payload {
            pieces.push_back(rest.split_to(max_payload));
        }
        pieces.push_back(rest);
        let len: usize = pieces.iter().map(|p| p.len()).sum();
        trace!(
            "Queued {} bytes on stream {} in {} fragment(s)",
            len,
            message.stream_id,
            pieces.len()
        );
        stream.queue.push_back(PendingMessage {
            ppid: message.ppid,
            unordered: message.unordered,
            max_retransmissions: message.max_retransmissions,
            pieces,
            ssn: None,
        });
        stream.queued_bytes += len;
        self.queued_bytes += len;
        Ok(())
    }

    /// Bytes queued in streams that have not been assigned a TSN.
    pub fn queued_bytes(&self) -> usize {
        self.queued_bytes
    }

    pub fn has_sendable(&self) -> bool {
        self.current.is_some() || self.send.iter().any(|s| !s.queue.is_empty() && !s.reset_pending)
    }

    /// Payload length of the fragment [`Self::next_fragment`] would return.
    pub(crate) fn peek_fragment_len(&self) -> Option<usize> {
        let sid = match self.current {
            Some(sid) => sid as usize,
            None => {
                let n = self.send.len();
                (0..n)
                    .map(|step| (self.cursor + step) % n)
                    .find(|&i| !self.send[i].queue.is_empty() && !self.send[i].reset_pending)?
            }
        };
        let message = self.send.get(sid)?.queue.front()?;
        message.pieces.front().map(|p| p.len())
    }

    /// Next fragment in round-robin order. A message in progress always
    /// finishes before another stream gets a turn so its fragments get
    /// consecutive TSNs; streams awaiting a reset are skipped.
    pub(crate) fn next_fragment(&mut self) -> Option<Fragment> {
        let sid = match self.current {
            Some(sid) => sid,
            None => {
                let n = self.send.len();
                let sid = (0..n)
                    .map(|step| (self.cursor + step) % n)
                    .find(|&i| !self.send[i].queue.is_empty() && !self.send[i].reset_pending)?;
                self.cursor = sid + 1;
                sid as u16
            }
        };
        let stream = self.send.get_mut(sid as usize)?;
        let message = stream.queue.front_mut()?;
        let beginning = message.ssn.is_none();
        let ssn = match message.ssn {
            Some(ssn) => ssn,
            None => {
                let ssn = if message.unordered { 0 } else { stream.next_ssn };
                if !message.unordered {
                    stream.next_ssn = stream.next_ssn.wrapping_add(1);
                }
                message.ssn = Some(ssn);
                ssn
            }
        };
        let payload = message.pieces.pop_front()?;
        let ending = message.pieces.is_empty();
        let fragment = Fragment {
            stream_id: sid,
            stream_seq: ssn,
            ppid: message.ppid,
            unordered: message.unordered,
            beginning,
            ending,
            payload,
            max_retransmissions: message.max_retransmissions,
        };
        if ending {
            stream.queue.pop_front();
            self.current = None;
        } else {
            self.current = Some(sid);
        }
        stream.queued_bytes -= fragment.payload.len();
        self.queued_bytes -= fragment.payload.len();
        Some(fragment)
    }

    pub(crate) fn set_reset_pending(&mut self, streams: &[u16], pending: bool) {
        for sid in streams {
            if let Some(stream) = self.send.get_mut(*sid as usize) {
                stream.reset_pending = pending;
            }
        }
    }

    /// A message on `sid` has fragments with TSNs and fragments still queued.
    pub(crate) fn fragment_in_progress(&self, sid: u16) -> bool {
        self.send.get(sid as usize).is_some_and(|s| s.in_progress())
    }

    pub(crate) fn any_fragment_in_progress(&self) -> bool {
        self.send.iter().any(|s| s.in_progress())
    }

    /// Restarts outgoing numbering at zero and releases the streams.
    pub(crate) fn reset_outgoing(&mut self, streams: &[u16]) {
        for sid in streams {
            if let Some(stream) = self.send.get_mut(*sid as usize) {
                stream.next_ssn = 0;
                stream.reset_pending = false;
            }
        }
    }

    pub(crate) fn reset_incoming(&mut self, streams: &[u16]) {
        for sid in streams {
            if let Some(stream) = self.receive.get_mut(*sid as usize) {
                stream.expected_ssn = 0;
            }
        }
    }

    /// Expands an empty stream list to every outgoing stream.
    pub(crate) fn all_outbound_if_empty(&self, streams: &[u16]) -> Vec<u16> {
        if streams.is_empty() {
            (0..self.outbound_count()).collect()
        } else {
            streams.to_vec()
        }
    }

    pub(crate) fn all_inbound_if_empty(&self, streams: &[u16]) -> Vec<u16> {
        if streams.is_empty() {
            (0..self.inbound_count()).collect()
        } else {
            streams.to_vec()
        }
    }

    pub fn next_ssn(&self, sid: u16) -> Option<u16> {
        self.send.get(sid as usize).map(|s| s.next_ssn)
    }

    pub fn expected_ssn(&self, sid: u16) -> Option<u16> {
        self.receive.get(sid as usize).map(|s| s.expected_ssn)
    }

    /// Buffers a received DATA chunk and returns the messages that became
    /// deliverable, each with the TSNs it consumed. Fragments for unknown
    /// streams are dropped.
    pub(crate) fn receive(&mut self, data: Data) -> Vec<(Message, Vec<u32>)> {
        let sid = data.stream_id;
        let Some(stream) = self.receive.get_mut(sid as usize) else {
            debug!("Dropping DATA for unknown stream {}", sid);
            return Vec::new();
        };
        stream.buffered_bytes += data.payload.len();
        stream.fragments.insert(data.tsn, data);
        stream.deliverable(sid)
    }

    pub fn buffered_bytes(&self) -> usize {
        self.receive.iter().map(|s| s.buffered_bytes).sum()
    }

    /// Buffered, undelivered TSNs above `tsn`, highest first.
    pub(crate) fn buffered_tsns_above(&self, tsn: u32) -> Vec<u32> {
        let mut tsns: Vec<u32> = self
            .receive
            .iter()
            .flat_map(|s| s.fragments.keys().copied())
            .filter(|t| tsn_gt(*t, tsn))
            .collect();
        tsns.sort_by_key(|t| std::cmp::Reverse(t.wrapping_sub(tsn)));
        tsns
    }

    /// Drops a buffered fragment. Returns the bytes released.
    pub(crate) fn drop_fragment(&mut self, tsn: u32) -> usize {
        for stream in &mut self.receive {
            if let Some(data) = stream.fragments.remove(&tsn) {
                stream.buffered_bytes -= data.payload.len();
                return data.payload.len();
            }
        }
        0
    }

    /// Applies a FORWARD TSN: forgets partial messages at or below `new_cum`,
    /// skips the listed ordered sequence numbers and returns whatever became
    /// deliverable.
    pub(crate) fn skip(&mut self, new_cum: u32, skipped: &[(u16, u16)]) -> Vec<(Message, Vec<u32>)> {
        for stream in &mut self.receive {
            let stale: Vec<u32> = stream
                .fragments
                .keys()
                .copied()
                .filter(|t| tsn_le(*t, new_cum))
                .collect();
            for tsn in stale {
                if let Some(data) = stream.fragments.remove(&tsn) {
                    stream.buffered_bytes -= data.payload.len();
                }
            }
        }
        for &(sid, ssn) in skipped {
            if let Some(stream) = self.receive.get_mut(sid as usize) {
                let next = ssn.wrapping_add(1);
                if ssn_gt(next, stream.expected_ssn) {
                    stream.expected_ssn = next;
                }
            }
        }
        self.drain_deliverable()
    }

    /// Collects every message that became deliverable on any stream, for
    /// example after an incoming reset restarted numbering.
    pub(crate) fn drain_deliverable(&mut self) -> Vec<(Message, Vec<u32>)> {
        let mut out = Vec::new();
        for (sid, stream) in self.receive.iter_mut().enumerate() {
            out.extend(stream.deliverable(sid as u16));
        }
        out
    }

    pub(crate) fn clear(&mut self) {
        for stream in &mut self.send {
            stream.queue.clear();
            stream.queued_bytes = 0;
        }
        self.current = None;
        self.queued_bytes = 0;
    }
}
