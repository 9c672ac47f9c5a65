use std::collections::VecDeque;
use std::time::{Duration, Instant};

use super::tracking::Arrival;

#[derive(Debug, Clone, Default)]
pub struct NetworkStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub packets_dropped: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub snapshots_skipped: u64,
}

/// Bytes per second over a sliding time window.
#[derive(Debug)]
pub struct RateMeter {
    window: Duration,
    samples: VecDeque<(Instant, usize)>,
}

impl RateMeter {
    pub fn new(window: Duration) -> Self {
        Self {
            window: window.max(Duration::from_millis(1)),
            samples: VecDeque::new(),
        }
    }

    pub fn record(&mut self, now: Instant, bytes: usize) {
        while self
            .samples
            .front()
            .is_some_and(|&(at, _)| now.saturating_duration_since(at) >= self.window)
        {
            self.samples.pop_front();
        }
        self.samples.push_back((now, bytes));
    }

    pub fn rate(&self, now: Instant) -> f32 {
        self.bytes_in_window(now) as f32 / self.window.as_secs_f32()
    }

    /// Whether sending `bytes` more right now would push the rate over `limit`.
    pub fn would_exceed(&self, now: Instant, bytes: usize, limit: u32) -> bool {
        (self.bytes_in_window(now) + bytes) as f32 / self.window.as_secs_f32() > limit as f32
    }

    pub fn reset(&mut self) {
        self.samples.clear();
    }

    fn bytes_in_window(&self, now: Instant) -> usize {
        self.samples
            .iter()
            .filter(|&&(at, _)| now.saturating_duration_since(at) < self.window)
            .map(|&(_, bytes)| bytes)
            .sum()
    }
}

/// Received/lost outcome of the last `capacity` packet sequences.
#[derive(Debug)]
pub struct LossWindow {
    capacity: usize,
    outcomes: VecDeque<(u32, bool)>,
}

impl LossWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            outcomes: VecDeque::with_capacity(capacity),
        }
    }

    pub fn record(&mut self, sequence: u32, arrival: Arrival) {
        match arrival {
            Arrival::Newest { skipped } => {
                let skipped = (skipped as usize).min(self.capacity) as u32;
                for behind in (1..=skipped).rev() {
                    self.push(sequence.wrapping_sub(behind), false);
                }
                self.push(sequence, true);
            }
            Arrival::Late => {
                if let Some(slot) = self.outcomes.iter_mut().find(|(seq, _)| *seq == sequence) {
                    slot.1 = true;
                }
            }
        }
    }

    /// Fraction of lost packets; an empty window reports no loss.
    pub fn loss(&self) -> f32 {
        if self.outcomes.is_empty() {
            return 0.0;
        }
        let lost = self.outcomes.iter().filter(|(_, received)| !received).count();
        lost as f32 / self.outcomes.len() as f32
    }

    pub fn reset(&mut self) {
        self.outcomes.clear();
    }

    fn push(&mut self, sequence: u32, received: bool) {
        if self.outcomes.len() >= self.capacity {
            self.outcomes.pop_front();
        }
        self.outcomes.push_back((sequence, received));
    }
}
