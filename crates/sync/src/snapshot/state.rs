use std::collections::BTreeMap;

use rkyv::{Archive, Deserialize, Serialize};

/// One replicated field of one entity.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Archive, Serialize, Deserialize,
)]
#[rkyv(derive(Debug))]
pub struct FieldKey {
    pub entity: u32,
    pub field: u16,
}

impl FieldKey {
    pub const fn new(entity: u32, field: u16) -> Self {
        Self { entity, field }
    }
}

/// Complete serialized simulation state; values are opaque to the network layer.
pub type StateMap = BTreeMap<FieldKey, Vec<u8>>;

#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct SnapshotEntry {
    pub key: FieldKey,
    /// `None` removes the field.
    pub value: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct Snapshot {
    pub sequence: u32,
    /// Snapshot this one is delta-encoded against; `None` for a full snapshot.
    pub base_sequence: Option<u32>,
    pub server_time_ms: u64,
    pub entries: Vec<SnapshotEntry>,
}

impl Snapshot {
    pub fn full(sequence: u32, server_time_ms: u64, state: &StateMap) -> Self {
        let entries = state
            .iter()
            .map(|(key, value)| SnapshotEntry {
                key: *key,
                value: Some(value.clone()),
            })
            .collect();
        Self {
            sequence,
            base_sequence: None,
            server_time_ms,
            entries,
        }
    }

    /// Only the fields of `state` that differ from `base`, plus removals.
    pub fn delta(
        sequence: u32,
        server_time_ms: u64,
        base_sequence: u32,
        base: &StateMap,
        state: &StateMap,
    ) -> Self {
        let mut entries: Vec<SnapshotEntry> = state
            .iter()
            .filter(|(key, value)| base.get(*key) != Some(*value))
            .map(|(key, value)| SnapshotEntry {
                key: *key,
                value: Some(value.clone()),
            })
            .collect();
        entries.extend(
            base.keys()
                .filter(|key| !state.contains_key(*key))
                .map(|key| SnapshotEntry {
                    key: *key,
                    value: None,
                }),
        );
        entries.sort_unstable_by_key(|entry| entry.key);

        Self {
            sequence,
            base_sequence: Some(base_sequence),
            server_time_ms,
            entries,
        }
    }

    pub fn is_full(&self) -> bool {
        self.base_sequence.is_none()
    }

    /// Split into parts that share this header, halving until every part `fits`.
    ///
    /// `None` when a single entry cannot fit or more than `max_parts` are needed.
    pub fn split_to_fit(
        self,
        max_parts: usize,
        fits: impl Fn(&Snapshot) -> bool,
    ) -> Option<Vec<Snapshot>> {
        let mut parts = Vec::new();
        self.split_into(max_parts, &fits, &mut parts)?;
        Some(parts)
    }

    fn split_into(
        self,
        max_parts: usize,
        fits: &impl Fn(&Snapshot) -> bool,
        parts: &mut Vec<Snapshot>,
    ) -> Option<()> {
        if fits(&self) {
            if parts.len() >= max_parts {
                return None;
            }
            parts.push(self);
            return Some(());
        }
        if self.entries.len() <= 1 {
            return None;
        }
        let (head, tail) = self.halve();
        head.split_into(max_parts, fits, parts)?;
        tail.split_into(max_parts, fits, parts)
    }

    fn halve(mut self) -> (Self, Self) {
        let entries = self.entries.split_off(self.entries.len() / 2);
        let tail = Self {
            sequence: self.sequence,
            base_sequence: self.base_sequence,
            server_time_ms: self.server_time_ms,
            entries,
        };
        (self, tail)
    }

    /// Reconstruct the complete state. A delta needs the state of its base.
    pub fn apply(&self, base: Option<&StateMap>) -> Option<StateMap> {
        let mut state = match (self.base_sequence, base) {
            (None, _) => StateMap::new(),
            (Some(_), Some(base)) => base.clone(),
            (Some(_), None) => return None,
        };
        for entry in &self.entries {
            match &entry.value {
                Some(value) => {
                    state.insert(entry.key, value.clone());
                }
                None => {
                    state.remove(&entry.key);
                }
            }
        }
        Some(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(fields: &[(u32, u16, u8)]) -> StateMap {
        fields
            .iter()
            .map(|&(entity, field, value)| (FieldKey::new(entity, field), vec![value]))
            .collect()
    }

    #[test]
    fn delta_carries_only_changes() {
        let base = state(&[(1, 0, 10), (1, 1, 20), (2, 0, 30)]);
        let next = state(&[(1, 0, 10), (1, 1, 21), (3, 0, 40)]);

        let delta = Snapshot::delta(5, 100, 4, &base, &next);
        assert_eq!(delta.base_sequence, Some(4));
        assert_eq!(
            delta.entries,
            vec![
                SnapshotEntry {
                    key: FieldKey::new(1, 1),
                    value: Some(vec![21]),
                },
                SnapshotEntry {
                    key: FieldKey::new(2, 0),
                    value: None,
                },
                SnapshotEntry {
                    key: FieldKey::new(3, 0),
                    value: Some(vec![40]),
                },
            ]
        );
        assert_eq!(delta.apply(Some(&base)), Some(next));
    }

    #[test]
    fn unchanged_state_gives_empty_delta() {
        let base = state(&[(1, 0, 1)]);
        let delta = Snapshot::delta(2, 0, 1, &base, &base);
        assert!(delta.entries.is_empty());
        assert_eq!(delta.apply(Some(&base)), Some(base));
    }

    #[test]
    fn full_snapshot_ignores_base() {
        let current = state(&[(1, 0, 1), (2, 0, 2)]);
        let stale = state(&[(9, 9, 9)]);
        let full = Snapshot::full(3, 0, &current);

        assert!(full.is_full());
        assert_eq!(full.apply(None), Some(current.clone()));
        assert_eq!(full.apply(Some(&stale)), Some(current));
    }

    #[test]
    fn split_parts_keep_order_and_header() {
        let fields: Vec<(u32, u16, u8)> = (0..10).map(|i| (i, 0, i as u8)).collect();
        let full = Snapshot::full(7, 50, &state(&fields));

        let parts = full.clone().split_to_fit(8, |part| part.entries.len() <= 3).unwrap();
        assert_eq!(parts.len(), 4);
        assert!(parts.iter().all(|part| part.sequence == 7 && part.is_full()));
        let rejoined: Vec<_> = parts.into_iter().flat_map(|part| part.entries).collect();
        assert_eq!(rejoined, full.entries);
    }

    #[test]
    fn split_gives_up_on_unfittable_entries() {
        let full = Snapshot::full(1, 0, &state(&[(1, 0, 1), (2, 0, 2)]));
        assert!(full.clone().split_to_fit(8, |_| false).is_none());
        assert!(full.clone().split_to_fit(1, |part| part.entries.len() <= 1).is_none());
        assert_eq!(full.split_to_fit(1, |_| true).map(|parts| parts.len()), Some(1));
    }

    #[test]
    fn delta_without_base_cannot_apply() {
        let base = state(&[(1, 0, 1)]);
        let delta = Snapshot::delta(2, 0, 1, &base, &state(&[(1, 0, 2)]));
        assert_eq!(delta.apply(None), None);
    }
}
