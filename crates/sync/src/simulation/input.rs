use std::collections::VecDeque;
use std::time::Instant;

use crate::net::sequence_greater_than;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferedInput {
    pub sequence: u32,
    pub issued_at: Instant,
    pub payload: Vec<u8>,
}

/// Local inputs the server has not acknowledged yet, oldest first.
pub struct InputBuffer {
    inputs: VecDeque<BufferedInput>,
    capacity: usize,
    last_sequence: u32,
}

impl InputBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            inputs: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
            last_sequence: 0,
        }
    }

    pub fn push(&mut self, payload: Vec<u8>, now: Instant) -> u32 {
        if self.inputs.len() >= self.capacity {
            self.inputs.pop_front();
        }
        self.last_sequence = self.last_sequence.wrapping_add(1).max(1);
        self.inputs.push_back(BufferedInput {
            sequence: self.last_sequence,
            issued_at: now,
            payload,
        });
        self.last_sequence
    }

    /// Drop every input up to and including `sequence`.
    pub fn acknowledge(&mut self, sequence: u32) -> usize {
        let mut dropped = 0;
        while self
            .inputs
            .front()
            .is_some_and(|input| !sequence_greater_than(input.sequence, sequence))
        {
            self.inputs.pop_front();
            dropped += 1;
        }
        dropped
    }

    pub fn iter(&self) -> impl Iterator<Item = &BufferedInput> {
        self.inputs.iter()
    }

    pub fn oldest(&self) -> Option<&BufferedInput> {
        self.inputs.front()
    }

    pub fn latest(&self) -> Option<&BufferedInput> {
        self.inputs.back()
    }

    /// Most recently assigned sequence, 0 before the first push.
    pub fn last_sequence(&self) -> u32 {
        self.last_sequence
    }

    pub fn clear(&mut self) {
        self.inputs.clear();
    }

    pub fn len(&self) -> usize {
        self.inputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_buffer_ordering() {
        let now = Instant::now();
        let mut buffer = InputBuffer::new(64);

        let first = buffer.push(vec![1], now);
        let second = buffer.push(vec![2], now);
        let third = buffer.push(vec![3], now);
        assert_eq!((first, second, third), (1, 2, 3));

        assert_eq!(buffer.acknowledge(2), 2);
        let remaining: Vec<u32> = buffer.iter().map(|i| i.sequence).collect();
        assert_eq!(remaining, vec![3]);
    }

    #[test]
    fn stale_acks_are_harmless() {
        let now = Instant::now();
        let mut buffer = InputBuffer::new(8);
        buffer.push(vec![], now);
        buffer.push(vec![], now);
        buffer.acknowledge(1);
        assert_eq!(buffer.acknowledge(1), 0);
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn full_buffer_drops_oldest() {
        let now = Instant::now();
        let mut buffer = InputBuffer::new(2);
        for i in 0..5u8 {
            buffer.push(vec![i], now);
        }
        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.oldest().map(|i| i.sequence), Some(4));
        assert_eq!(buffer.latest().map(|i| i.payload.clone()), Some(vec![4]));
    }
}
