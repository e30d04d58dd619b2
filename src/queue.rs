//! Sender-side records for DATA chunks that have been assigned a TSN.
//!
//! A chunk lives in exactly one of two maps: the retransmission queue holds
//! everything sent and not yet acknowledged cumulatively or non-revocably; the
//! transmission queue holds chunks waiting to be (re)sent.

use crate::chunk::Data;
use crate::path::PathId;
use crate::tsn::tsn_le;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::time::Instant;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkFlags {
    pub abandoned: bool,
    pub fast_retransmitted: bool,
    pub timer_retransmitted: bool,
    /// Bytes of this chunk are counted in its last path's outstanding bytes.
    pub counts_as_outstanding: bool,
    /// Revocably acknowledged by a gap report.
    pub acked: bool,
    /// Newly acked bytes were already credited to the congestion controller.
    pub counted_as_newly_acked: bool,
    /// Moved to another path by a retransmission timeout.
    pub moved: bool,
    pub reneged: bool,
    pub packet_dropped: bool,
}

#[derive(Debug, Clone)]
pub struct DataChunk {
    pub tsn: u32,
    pub stream_id: u16,
    pub stream_seq: u16,
    pub ppid: u32,
    pub unordered: bool,
    pub beginning: bool,
    pub ending: bool,
    pub payload: Bytes,
    pub(crate) last_path: Option<PathId>,
    pub(crate) next_path: Option<PathId>,
    pub(crate) transmissions: u32,
    pub(crate) retransmissions: u32,
    pub(crate) send_time: Option<Instant>,
    pub(crate) max_retransmissions: Option<u32>,
    pub(crate) flags: ChunkFlags,
    pub(crate) gap_reports: u32,
}

impl DataChunk {
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn last_path(&self) -> Option<PathId> {
        self.last_path
    }

    pub fn flags(&self) -> ChunkFlags {
        self.flags
    }

    pub fn gap_reports(&self) -> u32 {
        self.gap_reports
    }

    pub fn transmissions(&self) -> u32 {
        self.transmissions
    }

    pub(crate) fn to_wire(&self) -> Data {
        Data {
            tsn: self.tsn,
            stream_id: self.stream_id,
            stream_seq: self.stream_seq,
            ppid: self.ppid,
            unordered: self.unordered,
            beginning: self.beginning,
            ending: self.ending,
            immediate: false,
            payload: self.payload.clone(),
        }
    }
}

#[derive(Debug, Default)]
pub struct OutboundQueues {
    pub(crate) transmission: BTreeMap<u32, DataChunk>,
    pub(crate) retransmission: BTreeMap<u32, DataChunk>,
}

impl OutboundQueues {
    pub fn get(&self, tsn: u32) -> Option<&DataChunk> {
        self.retransmission
            .get(&tsn)
            .or_else(|| self.transmission.get(&tsn))
    }

    pub(crate) fn get_mut(&mut self, tsn: u32) -> Option<&mut DataChunk> {
        match self.retransmission.get_mut(&tsn) {
            Some(chunk) => Some(chunk),
            None => self.transmission.get_mut(&tsn),
        }
    }

    pub fn is_pending_transmission(&self, tsn: u32) -> bool {
        self.transmission.contains_key(&tsn)
    }

    /// Moves a sent chunk into the transmission queue.
    pub(crate) fn schedule_retransmission(&mut self, tsn: u32) -> Option<&mut DataChunk> {
        let chunk = self.retransmission.remove(&tsn)?;
        Some(self.transmission.entry(tsn).or_insert(chunk))
    }

    /// Moves an acknowledged chunk back out of the transmission queue.
    pub(crate) fn cancel_retransmission(&mut self, tsn: u32) {
        if let Some(mut chunk) = self.transmission.remove(&tsn) {
            chunk.next_path = None;
            self.retransmission.insert(tsn, chunk);
        }
    }

    pub(crate) fn insert_sent(&mut self, chunk: DataChunk) {
        self.retransmission.insert(chunk.tsn, chunk);
    }

    pub(crate) fn remove(&mut self, tsn: u32) -> Option<DataChunk> {
        self.retransmission
            .remove(&tsn)
            .or_else(|| self.transmission.remove(&tsn))
    }

    /// TSNs at or below `cum` in either queue, in serial order.
    pub(crate) fn tsns_up_to(&self, cum: u32) -> Vec<u32> {
        let mut tsns: Vec<u32> = self
            .all()
            .filter(|c| tsn_le(c.tsn, cum))
            .map(|c| c.tsn)
            .collect();
        tsns.sort_by_key(|tsn| tsn.wrapping_sub(cum) as i32);
        tsns
    }

    pub fn all(&self) -> impl Iterator<Item = &DataChunk> {
        self.retransmission.values().chain(self.transmission.values())
    }

    pub fn len(&self) -> usize {
        self.retransmission.len() + self.transmission.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_bytes(&self) -> usize {
        self.all().map(|c| c.len()).sum()
    }

    /// Bytes waiting in the transmission queue for `path`.
    pub fn queued_bytes_for(&self, path: PathId) -> usize {
        self.transmission
            .values()
            .filter(|c| c.next_path == Some(path))
            .map(|c| c.len())
            .sum()
    }

    /// Bytes of `stream_id` that have a TSN and are not yet acknowledged
    /// cumulatively or non-revocably.
    pub fn bytes_in_flight_for_stream(&self, stream_id: u16) -> usize {
        self.all()
            .filter(|c| c.stream_id == stream_id)
            .map(|c| c.len())
            .sum()
    }

    pub(crate) fn clear(&mut self) {
        self.transmission.clear();
        self.retransmission.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(tsn: u32, stream_id: u16, len: usize) -> DataChunk {
        DataChunk {
            tsn,
            stream_id,
            stream_seq: 0,
            ppid: 0,
            unordered: false,
            beginning: true,
            ending: true,
            payload: Bytes::from(vec![0u8; len]),
            last_path: Some(PathId(0)),
            next_path: None,
            transmissions: 1,
            retransmissions: 0,
            send_time: None,
            max_retransmissions: None,
            flags: ChunkFlags::default(),
            gap_reports: 0,
        }
    }

    #[test]
    fn test_chunk_lives_in_one_queue() {
        let mut queues = OutboundQueues::default();
        queues.insert_sent(chunk(1, 0, 100));
        queues.insert_sent(chunk(2, 2, 500));

        let scheduled = queues.schedule_retransmission(2).unwrap();
        scheduled.next_path = Some(PathId(1));
        assert!(queues.is_pending_transmission(2));
        assert_eq!(queues.len(), 2);
        assert_eq!(queues.queued_bytes_for(PathId(1)), 500);
        assert_eq!(queues.bytes_in_flight_for_stream(2), 500);

        queues.cancel_retransmission(2);
        assert!(!queues.is_pending_transmission(2));
        assert_eq!(queues.get(2).and_then(|c| c.next_path), None, "stale destination is cleared");
        assert_eq!(queues.queued_bytes_for(PathId(1)), 0);
    }

    #[test]
    fn test_tsns_up_to_across_wrap() {
        let mut queues = OutboundQueues::default();
        for tsn in [u32::MAX - 1, u32::MAX, 0, 1, 2] {
            queues.insert_sent(chunk(tsn, 0, 10));
        }
        assert_eq!(queues.tsns_up_to(0), vec![u32::MAX - 1, u32::MAX, 0]);
    }
}
