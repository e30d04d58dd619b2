//! Received-TSN bookkeeping shared by both directions.
//!
//! On the receive side a [`GapList`] records which TSNs above the cumulative
//! point have arrived and whether each one was acknowledged revocably (may
//! still be reneged) or non-revocably. On the send side a SACK is decoded into
//! the same structure so the acknowledgment walk can ask about single TSNs.

use crate::error::{SctpError, SctpResult};
use crate::tsn::{tsn_ge, tsn_gt, tsn_le, tsn_lt, tsn_max};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckKind {
    Revocable,
    NonRevocable,
}

/// Gap ack block as it appears on the wire: offsets relative to the
/// cumulative TSN ack, both inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GapBlock {
    pub start: u16,
    pub end: u16,
}

impl GapBlock {
    pub fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }
}

/// Ascending, non-adjacent TSN ranges, compared in serial order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct RangeSet {
    ranges: Vec<(u32, u32)>,
}

impl RangeSet {
    fn contains(&self, tsn: u32) -> bool {
        self.ranges
            .iter()
            .any(|&(s, e)| tsn_ge(tsn, s) && tsn_le(tsn, e))
    }

    fn insert(&mut self, tsn: u32) -> bool {
        let mut i = 0;
        while i < self.ranges.len() && tsn_lt(self.ranges[i].1.wrapping_add(1), tsn) {
            i += 1;
        }
        if i == self.ranges.len() {
            self.ranges.push((tsn, tsn));
            return true;
        }
        let (start, end) = self.ranges[i];
        if tsn_ge(tsn, start) && tsn_le(tsn, end) {
            return false;
        }
        if tsn == end.wrapping_add(1) {
            self.ranges[i].1 = tsn;
            if i + 1 < self.ranges.len() && self.ranges[i + 1].0 == tsn.wrapping_add(1) {
                self.ranges[i].1 = self.ranges[i + 1].1;
                self.ranges.remove(i + 1);
            }
        } else if tsn == start.wrapping_sub(1) {
            self.ranges[i].0 = tsn;
        } else {
            self.ranges.insert(i, (tsn, tsn));
        }
        true
    }

    fn remove(&mut self, tsn: u32) -> bool {
        let Some(i) = self
            .ranges
            .iter()
            .position(|&(s, e)| tsn_ge(tsn, s) && tsn_le(tsn, e))
        else {
            return false;
        };
        let (start, end) = self.ranges[i];
        match (tsn == start, tsn == end) {
            (true, true) => {
                self.ranges.remove(i);
            }
            (true, false) => self.ranges[i].0 = tsn.wrapping_add(1),
            (false, true) => self.ranges[i].1 = tsn.wrapping_sub(1),
            (false, false) => {
                self.ranges[i].1 = tsn.wrapping_sub(1);
                self.ranges.insert(i + 1, (tsn.wrapping_add(1), end));
            }
        }
        true
    }

    fn remove_up_to(&mut self, tsn: u32) {
        self.ranges.retain(|&(_, e)| tsn_gt(e, tsn));
        if let Some(first) = self.ranges.first_mut() {
            if tsn_le(first.0, tsn) {
                first.0 = tsn.wrapping_add(1);
            }
        }
    }

    fn last_end(&self) -> Option<u32> {
        self.ranges.last().map(|&(_, e)| e)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GapList {
    cum_ack_tsn: u32,
    revocable: RangeSet,
    non_revocable: RangeSet,
}

impl GapList {
    pub fn new(cum_ack_tsn: u32) -> Self {
        Self {
            cum_ack_tsn,
            revocable: RangeSet::default(),
            non_revocable: RangeSet::default(),
        }
    }

    /// Rebuilds the acknowledgment state carried by a SACK or NR-SACK.
    ///
    /// Gap blocks must be ascending, start above the cumulative point and must
    /// not overlap; otherwise the whole acknowledgment is rejected. TSNs that
    /// appear in both lists are non-revocable unless `nr_subtract_r_gaps` is
    /// set, in which case the revocable report takes precedence.
    pub fn from_sack(
        cum_ack_tsn: u32,
        gap_blocks: &[GapBlock],
        nr_gap_blocks: &[GapBlock],
        nr_subtract_r_gaps: bool,
    ) -> SctpResult<Self> {
        validate_blocks(gap_blocks)?;
        validate_blocks(nr_gap_blocks)?;

        let mut list = GapList::new(cum_ack_tsn);
        for block in gap_blocks {
            for offset in block.start..=block.end {
                list.insert(cum_ack_tsn.wrapping_add(offset as u32), AckKind::Revocable);
            }
        }
        for block in nr_gap_blocks {
            for offset in block.start..=block.end {
                let tsn = cum_ack_tsn.wrapping_add(offset as u32);
                if nr_subtract_r_gaps && list.kind_of(tsn) == Some(AckKind::Revocable) {
                    continue;
                }
                list.insert(tsn, AckKind::NonRevocable);
            }
        }
        Ok(list)
    }

    pub fn cum_ack_tsn(&self) -> u32 {
        self.cum_ack_tsn
    }

    /// Highest TSN known to be received, cumulative or in a gap.
    pub fn highest_tsn(&self) -> u32 {
        let mut highest = self.cum_ack_tsn;
        if let Some(e) = self.revocable.last_end() {
            highest = tsn_max(highest, e);
        }
        if let Some(e) = self.non_revocable.last_end() {
            highest = tsn_max(highest, e);
        }
        highest
    }

    pub fn has_gaps(&self) -> bool {
        !self.revocable.ranges.is_empty() || !self.non_revocable.ranges.is_empty()
    }

    pub fn is_received(&self, tsn: u32) -> bool {
        tsn_le(tsn, self.cum_ack_tsn) || self.kind_of(tsn).is_some()
    }

    /// Acknowledgment kind of a TSN above the cumulative point.
    pub fn kind_of(&self, tsn: u32) -> Option<AckKind> {
        if self.non_revocable.contains(tsn) {
            Some(AckKind::NonRevocable)
        } else if self.revocable.contains(tsn) {
            Some(AckKind::Revocable)
        } else {
            None
        }
    }

    /// Records `tsn` with the given kind without moving the cumulative point.
    ///
    /// The latest call wins: a TSN already held as non-revocable is moved back
    /// to the revocable set when inserted as revocable. Returns `true` if the
    /// TSN was not known before.
    pub fn insert(&mut self, tsn: u32, kind: AckKind) -> bool {
        if tsn_le(tsn, self.cum_ack_tsn) {
            return false;
        }
        let (target, other) = match kind {
            AckKind::Revocable => (&mut self.revocable, &mut self.non_revocable),
            AckKind::NonRevocable => (&mut self.non_revocable, &mut self.revocable),
        };
        let moved = other.remove(tsn);
        target.insert(tsn) && !moved
    }

    /// Receive-side insert: records `tsn` and advances the cumulative point
    /// over any now-contiguous prefix.
    pub fn mark_received(&mut self, tsn: u32, kind: AckKind) -> bool {
        let inserted = self.insert(tsn, kind);
        self.advance();
        inserted
    }

    /// Forgets a revocably received TSN. Non-revocable TSNs are never removed.
    pub fn renege(&mut self, tsn: u32) -> bool {
        self.revocable.remove(tsn)
    }

    /// Moves the cumulative point forward (FORWARD_TSN) and drops any gap
    /// entries it now covers.
    pub fn forward_cum_ack(&mut self, new_cum: u32) {
        if tsn_le(new_cum, self.cum_ack_tsn) {
            return;
        }
        self.cum_ack_tsn = new_cum;
        self.revocable.remove_up_to(new_cum);
        self.non_revocable.remove_up_to(new_cum);
        self.advance();
    }

    fn advance(&mut self) {
        loop {
            let next = self.cum_ack_tsn.wrapping_add(1);
            let set = if self.revocable.ranges.first().is_some_and(|r| r.0 == next) {
                &mut self.revocable
            } else if self.non_revocable.ranges.first().is_some_and(|r| r.0 == next) {
                &mut self.non_revocable
            } else {
                break;
            };
            let (_, end) = set.ranges.remove(0);
            self.cum_ack_tsn = end;
        }
    }

    /// TSN ranges of one kind, ascending.
    pub fn ranges(&self, kind: AckKind) -> &[(u32, u32)] {
        match kind {
            AckKind::Revocable => &self.revocable.ranges,
            AckKind::NonRevocable => &self.non_revocable.ranges,
        }
    }

    /// All received TSN ranges above the cumulative point regardless of kind,
    /// merged and ascending.
    pub fn merged_ranges(&self) -> Vec<(u32, u32)> {
        let cum = self.cum_ack_tsn;
        let mut all: Vec<(u32, u32)> = self
            .revocable
            .ranges
            .iter()
            .chain(self.non_revocable.ranges.iter())
            .copied()
            .collect();
        all.sort_by_key(|&(s, _)| s.wrapping_sub(cum));

        let mut merged: Vec<(u32, u32)> = Vec::with_capacity(all.len());
        for (start, end) in all {
            match merged.last_mut() {
                Some(last) if tsn_le(start, last.1.wrapping_add(1)) => {
                    last.1 = tsn_max(last.1, end);
                }
                _ => merged.push((start, end)),
            }
        }
        merged
    }

    /// Wire gap blocks. `None` reports every received TSN (plain SACK gap
    /// blocks); `Some(kind)` reports only that kind. Output is capped at
    /// `max_blocks` and stops at the first range beyond the 16-bit offset.
    pub fn gap_blocks(&self, kind: Option<AckKind>, max_blocks: usize) -> Vec<GapBlock> {
        let ranges = match kind {
            None => self.merged_ranges(),
            Some(kind) => self.ranges(kind).to_vec(),
        };
        let mut blocks = Vec::new();
        for (start, end) in ranges {
            if blocks.len() >= max_blocks {
                break;
            }
            let start_off = start.wrapping_sub(self.cum_ack_tsn);
            let end_off = end.wrapping_sub(self.cum_ack_tsn);
            if start_off > u16::MAX as u32 {
                break;
            }
            blocks.push(GapBlock::new(start_off as u16, end_off.min(u16::MAX as u32) as u16));
        }
        blocks
    }
}

fn validate_blocks(blocks: &[GapBlock]) -> SctpResult<()> {
    let mut previous_end: Option<u16> = None;
    for block in blocks {
        if block.start == 0 {
            return Err(SctpError::MalformedGapList("block starts at the cumulative point"));
        }
        if block.start > block.end {
            return Err(SctpError::MalformedGapList("block start after block end"));
        }
        if let Some(prev) = previous_end {
            if block.start <= prev {
                return Err(SctpError::MalformedGapList("blocks overlap or are not ascending"));
            }
        }
        previous_end = Some(block.end);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_receive_in_order_advances_cum() {
        let mut list = GapList::new(10);
        assert!(list.mark_received(11, AckKind::Revocable));
        assert!(list.mark_received(12, AckKind::Revocable));
        assert_eq!(list.cum_ack_tsn(), 12);
        assert!(!list.has_gaps());
        assert!(!list.mark_received(12, AckKind::Revocable), "duplicate must not be new");
    }

    #[test]
    fn test_gap_then_fill() {
        let mut list = GapList::new(0);
        list.mark_received(2, AckKind::Revocable);
        list.mark_received(3, AckKind::Revocable);
        list.mark_received(5, AckKind::NonRevocable);
        assert_eq!(list.cum_ack_tsn(), 0);
        assert_eq!(list.highest_tsn(), 5);
        assert_eq!(
            list.gap_blocks(None, 16),
            vec![GapBlock::new(2, 3), GapBlock::new(5, 5)]
        );
        assert_eq!(
            list.gap_blocks(Some(AckKind::NonRevocable), 16),
            vec![GapBlock::new(5, 5)]
        );

        list.mark_received(1, AckKind::Revocable);
        assert_eq!(list.cum_ack_tsn(), 3, "1..3 now contiguous");
        list.mark_received(4, AckKind::Revocable);
        assert_eq!(list.cum_ack_tsn(), 5, "advance runs across both kinds");
        assert!(!list.has_gaps());
    }

    #[test]
    fn test_from_sack_nr_precedence() {
        let r = [GapBlock::new(2, 4)];
        let nr = [GapBlock::new(3, 3)];

        let list = GapList::from_sack(100, &r, &nr, false).unwrap();
        assert_eq!(list.kind_of(103), Some(AckKind::NonRevocable));
        assert_eq!(list.kind_of(102), Some(AckKind::Revocable));
        assert_eq!(list.kind_of(101), None);
        assert_eq!(list.cum_ack_tsn(), 100, "decoded lists never advance");

        let list = GapList::from_sack(100, &r, &nr, true).unwrap();
        assert_eq!(
            list.kind_of(103),
            Some(AckKind::Revocable),
            "subtract flag keeps the revocable report"
        );
    }

    #[test]
    fn test_mixed_kinds_survive_the_wire() {
        use crate::chunk::{Chunk, Sack};
        use bytes::{Buf, BytesMut};

        let mut received = GapList::new(100);
        for tsn in [102, 103, 106, 110] {
            received.insert(tsn, AckKind::Revocable);
        }
        for tsn in [104, 107, 108] {
            received.insert(tsn, AckKind::NonRevocable);
        }

        let sack = Chunk::Sack(Sack {
            cum_tsn_ack: received.cum_ack_tsn(),
            a_rwnd: 1000,
            gap_blocks: received.gap_blocks(Some(AckKind::Revocable), 16),
            nr_gap_blocks: received.gap_blocks(Some(AckKind::NonRevocable), 16),
            ..Default::default()
        });
        let mut buf = BytesMut::new();
        sack.encode(&mut buf);
        let mut wire = buf.freeze();
        let code = wire.get_u8();
        let flags = wire.get_u8();
        let length = wire.get_u16() as usize;
        let body = wire.split_to(length - 4);
        let Some(Chunk::Sack(decoded)) = Chunk::decode(code, flags, body).unwrap() else {
            panic!("expected an NR-SACK");
        };

        let rebuilt = GapList::from_sack(
            decoded.cum_tsn_ack,
            &decoded.gap_blocks,
            &decoded.nr_gap_blocks,
            decoded.nr_subtract_r_gaps,
        )
        .unwrap();
        for tsn in 101..=111 {
            assert_eq!(
                rebuilt.kind_of(tsn),
                received.kind_of(tsn),
                "kind of TSN {} changed on the wire",
                tsn
            );
        }
        assert_eq!(rebuilt, received);
    }

    #[test]
    fn test_from_sack_rejects_malformed() {
        let overlapping = [GapBlock::new(2, 5), GapBlock::new(4, 8)];
        assert!(GapList::from_sack(0, &overlapping, &[], false).is_err());
        let descending = [GapBlock::new(6, 8), GapBlock::new(2, 3)];
        assert!(GapList::from_sack(0, &descending, &[], false).is_err());
        let inverted = [GapBlock::new(4, 3)];
        assert!(GapList::from_sack(0, &inverted, &[], false).is_err());
        let at_cum = [GapBlock::new(0, 3)];
        assert!(GapList::from_sack(0, &[], &at_cum, false).is_err());
    }

    #[test]
    fn test_latest_insert_wins_including_downgrade() {
        let mut list = GapList::new(0);
        list.insert(7, AckKind::NonRevocable);
        assert_eq!(list.kind_of(7), Some(AckKind::NonRevocable));
        assert!(!list.insert(7, AckKind::Revocable), "not a new TSN");
        assert_eq!(
            list.kind_of(7),
            Some(AckKind::Revocable),
            "a later revocable report moves the TSN back"
        );
    }

    #[test]
    fn test_renege_only_revocable() {
        let mut list = GapList::new(0);
        list.mark_received(3, AckKind::Revocable);
        list.mark_received(4, AckKind::Revocable);
        list.mark_received(5, AckKind::Revocable);
        list.mark_received(6, AckKind::NonRevocable);
        assert!(list.renege(4));
        assert!(!list.renege(6), "non-revocable TSNs stay");
        assert_eq!(list.ranges(AckKind::Revocable), &[(3, 3), (5, 5)]);
    }

    #[test]
    fn test_forward_cum_ack_drops_covered_gaps() {
        let mut list = GapList::new(10);
        list.mark_received(13, AckKind::Revocable);
        list.mark_received(16, AckKind::Revocable);
        list.forward_cum_ack(14);
        assert_eq!(list.cum_ack_tsn(), 14);
        list.mark_received(15, AckKind::Revocable);
        assert_eq!(list.cum_ack_tsn(), 16);
    }

    #[test]
    fn test_wraparound_ranges() {
        let mut list = GapList::new(u32::MAX - 2);
        list.mark_received(u32::MAX, AckKind::Revocable);
        list.mark_received(0, AckKind::Revocable);
        list.mark_received(1, AckKind::Revocable);
        assert_eq!(list.gap_blocks(None, 16), vec![GapBlock::new(2, 4)]);
        list.mark_received(u32::MAX - 1, AckKind::Revocable);
        assert_eq!(list.cum_ack_tsn(), 1);
    }

    #[test]
    fn test_gap_blocks_capped() {
        let mut list = GapList::new(0);
        for i in 0..40u32 {
            list.mark_received(2 + i * 2, AckKind::Revocable);
        }
        assert_eq!(list.gap_blocks(None, 16).len(), 16);
    }
}
