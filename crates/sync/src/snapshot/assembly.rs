use std::collections::BTreeMap;

use crate::net::{MAX_SNAPSHOT_PARTS, SnapshotFrame, sequence_greater_than};

use super::state::Snapshot;

/// Incomplete snapshots kept around while their remaining parts are in flight.
const MAX_PENDING: usize = 4;

#[derive(Debug)]
struct Pending {
    parts: Vec<Option<Snapshot>>,
    received: usize,
}

impl Pending {
    fn new(part_count: u16) -> Self {
        Self {
            parts: vec![None; part_count as usize],
            received: 0,
        }
    }
}

/// Rebuilds snapshots that were split across several datagrams.
///
/// A snapshot is surfaced only once every part arrived; one that is
/// overtaken by a newer complete snapshot is dropped whole.
#[derive(Debug, Default)]
pub struct SnapshotAssembler {
    pending: BTreeMap<u32, Pending>,
    newest_complete: Option<u32>,
}

impl SnapshotAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, frame: SnapshotFrame) -> Option<SnapshotFrame> {
        let SnapshotFrame {
            snapshot,
            input_ack,
            part_index,
            part_count,
        } = frame;
        let sequence = snapshot.sequence;

        if part_count == 0 || part_index >= part_count || part_count > MAX_SNAPSHOT_PARTS {
            log::debug!("dropping snapshot {sequence} part {part_index}/{part_count}");
            return None;
        }
        if self
            .newest_complete
            .is_some_and(|done| !sequence_greater_than(sequence, done))
        {
            return None;
        }
        if part_count == 1 {
            self.complete(sequence);
            return Some(SnapshotFrame::whole(snapshot, input_ack));
        }

        let pending = self
            .pending
            .entry(sequence)
            .or_insert_with(|| Pending::new(part_count));
        if pending.parts.len() != part_count as usize {
            *pending = Pending::new(part_count);
        }
        let slot = &mut pending.parts[part_index as usize];
        if slot.is_none() {
            *slot = Some(snapshot);
            pending.received += 1;
        }

        if pending.received < pending.parts.len() {
            self.evict_oldest();
            return None;
        }

        let pending = self.pending.remove(&sequence)?;
        let mut parts = pending.parts.into_iter().flatten();
        let mut whole = parts.next()?;
        for part in parts {
            whole.entries.extend(part.entries);
        }
        self.complete(sequence);
        Some(SnapshotFrame::whole(whole, input_ack))
    }

    fn complete(&mut self, sequence: u32) {
        self.newest_complete = Some(sequence);
        self.pending
            .retain(|&pending, _| sequence_greater_than(pending, sequence));
    }

    fn evict_oldest(&mut self) {
        while self.pending.len() > MAX_PENDING {
            let oldest = self
                .pending
                .keys()
                .copied()
                .reduce(|a, b| if sequence_greater_than(a, b) { b } else { a });
            match oldest {
                Some(sequence) => self.pending.remove(&sequence),
                None => break,
            };
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
        self.newest_complete = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::{FieldKey, StateMap};

    fn parts(sequence: u32, fields: u32, per_part: usize) -> Vec<SnapshotFrame> {
        let state: StateMap = (0..fields)
            .map(|entity| (FieldKey::new(entity, 0), vec![entity as u8]))
            .collect();
        let chunks = Snapshot::full(sequence, 0, &state)
            .split_to_fit(MAX_SNAPSHOT_PARTS as usize, |part| part.entries.len() <= per_part)
            .unwrap();
        let count = chunks.len() as u16;
        chunks
            .into_iter()
            .enumerate()
            .map(|(index, snapshot)| SnapshotFrame {
                snapshot,
                input_ack: Some(3),
                part_index: index as u16,
                part_count: count,
            })
            .collect()
    }

    #[test]
    fn out_of_order_parts_reassemble() {
        let mut assembler = SnapshotAssembler::new();
        let mut frames = parts(5, 12, 3);
        assert_eq!(frames.len(), 4);
        frames.reverse();
        let duplicate = frames[0].clone();

        let last = frames.pop().unwrap();
        for frame in frames {
            assert!(assembler.insert(frame).is_none());
        }
        assert!(assembler.insert(duplicate).is_none());

        let whole = assembler.insert(last).unwrap();
        assert_eq!(whole.part_count, 1);
        assert_eq!(whole.input_ack, Some(3));
        let keys: Vec<u32> = whole.snapshot.entries.iter().map(|e| e.key.entity).collect();
        assert_eq!(keys, (0..12).collect::<Vec<_>>());
        assert_eq!(assembler.pending_len(), 0);
    }

    #[test]
    fn newer_snapshot_discards_incomplete_ones() {
        let mut assembler = SnapshotAssembler::new();
        let old = parts(1, 6, 3);
        assert!(assembler.insert(old[0].clone()).is_none());

        let newer = parts(2, 1, 3);
        assert!(assembler.insert(newer[0].clone()).is_some());
        assert_eq!(assembler.pending_len(), 0);
        assert!(assembler.insert(old[1].clone()).is_none());
    }

    #[test]
    fn malformed_part_headers_are_dropped() {
        let mut assembler = SnapshotAssembler::new();
        let mut frame = parts(1, 2, 1).remove(0);
        frame.part_index = frame.part_count;
        assert!(assembler.insert(frame.clone()).is_none());
        frame.part_count = 0;
        assert!(assembler.insert(frame).is_none());
        assert_eq!(assembler.pending_len(), 0);
    }

    #[test]
    fn pending_snapshots_are_bounded() {
        let mut assembler = SnapshotAssembler::new();
        for sequence in 1..=10 {
            assembler.insert(parts(sequence, 4, 1).remove(0));
        }
        assert_eq!(assembler.pending_len(), MAX_PENDING);
    }
}
