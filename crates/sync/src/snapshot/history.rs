use std::collections::VecDeque;

use crate::net::sequence_greater_than;

use super::state::StateMap;

#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub sequence: u32,
    pub server_time_ms: u64,
    pub state: StateMap,
}

/// Ring of reconstructed states keyed by snapshot sequence, oldest first.
#[derive(Debug)]
pub struct SnapshotHistory {
    entries: VecDeque<HistoryEntry>,
    capacity: usize,
}

impl SnapshotHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Sequences must be pushed in increasing order; stale ones are ignored.
    pub fn push(&mut self, sequence: u32, server_time_ms: u64, state: StateMap) -> bool {
        if self
            .latest()
            .is_some_and(|latest| !sequence_greater_than(sequence, latest.sequence))
        {
            return false;
        }
        self.entries.push_back(HistoryEntry {
            sequence,
            server_time_ms,
            state,
        });
        true
    }

    /// Evict from the front while over capacity, skipping nothing still `referenced`,
    /// and unconditionally drop entries more than `max_age` sequences old.
    pub fn evict(&mut self, max_age: u32, referenced: impl Fn(u32) -> bool) {
        let Some(newest) = self.latest().map(|entry| entry.sequence) else {
            return;
        };
        while let Some(front) = self.entries.front() {
            let too_old = newest.wrapping_sub(front.sequence) > max_age;
            let over_capacity = self.entries.len() > self.capacity && !referenced(front.sequence);
            if !(too_old || over_capacity) {
                break;
            }
            self.entries.pop_front();
        }
    }

    /// Plain ring eviction for holders without delta references.
    pub fn trim(&mut self) {
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
        }
    }

    pub fn get(&self, sequence: u32) -> Option<&HistoryEntry> {
        self.entries.iter().rev().find(|entry| entry.sequence == sequence)
    }

    pub fn state(&self, sequence: u32) -> Option<&StateMap> {
        self.get(sequence).map(|entry| &entry.state)
    }

    pub fn latest(&self) -> Option<&HistoryEntry> {
        self.entries.back()
    }

    pub fn oldest(&self) -> Option<&HistoryEntry> {
        self.entries.front()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::FieldKey;

    fn state(value: u8) -> StateMap {
        StateMap::from([(FieldKey::new(1, 0), vec![value])])
    }

    #[test]
    fn lookup_by_sequence() {
        let mut history = SnapshotHistory::new(64);
        for sequence in 1..=10 {
            history.push(sequence, sequence as u64 * 16, state(sequence as u8));
        }

        assert_eq!(history.state(5), Some(&state(5)));
        assert_eq!(history.get(7).map(|e| e.server_time_ms), Some(112));
        assert!(history.get(11).is_none());
    }

    #[test]
    fn stale_pushes_are_ignored() {
        let mut history = SnapshotHistory::new(8);
        assert!(history.push(3, 0, state(3)));
        assert!(!history.push(3, 0, state(4)));
        assert!(!history.push(2, 0, state(2)));
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn eviction_keeps_referenced_bases() {
        let mut history = SnapshotHistory::new(4);
        for sequence in 1..=6 {
            history.push(sequence, 0, state(sequence as u8));
        }

        history.evict(32, |sequence| sequence == 1);
        assert_eq!(history.oldest().map(|e| e.sequence), Some(1));
        assert_eq!(history.len(), 6);

        history.evict(32, |_| false);
        assert_eq!(history.len(), 4);
        assert_eq!(history.oldest().map(|e| e.sequence), Some(3));
    }

    #[test]
    fn eviction_drops_bases_past_max_age() {
        let mut history = SnapshotHistory::new(64);
        for sequence in 1..=10 {
            history.push(sequence, 0, state(sequence as u8));
        }
        history.evict(3, |_| true);
        assert_eq!(history.oldest().map(|e| e.sequence), Some(7));
    }

    #[test]
    fn trim_is_a_plain_ring() {
        let mut history = SnapshotHistory::new(2);
        for sequence in 1..=5 {
            history.push(sequence, 0, state(sequence as u8));
            history.trim();
        }
        assert_eq!(history.len(), 2);
        assert_eq!(history.oldest().map(|e| e.sequence), Some(4));
    }
}
