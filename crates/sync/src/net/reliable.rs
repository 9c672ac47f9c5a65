use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use crate::config::ReliableConfig;
use crate::error::{Result, SyncError};

use super::protocol::{MAX_FRAGMENT_PAYLOAD, ReliableFragment, sequence_greater_than};

/// Sequence 0 means "nothing yet" on the wire, so counting skips it.
#[inline]
fn next_sequence(sequence: u32) -> u32 {
    match sequence.wrapping_add(1) {
        0 => 1,
        next => next,
    }
}

#[derive(Debug)]
struct OutgoingMessage {
    sequence: u32,
    fragments: Vec<Vec<u8>>,
    bytes: usize,
    last_sent: Option<Instant>,
    sends: u32,
}

#[derive(Debug)]
struct IncomingMessage {
    fragments: Vec<Option<Vec<u8>>>,
    missing: usize,
}

impl IncomingMessage {
    fn new(fragment_count: u16) -> Self {
        Self {
            fragments: vec![None; fragment_count as usize],
            missing: fragment_count as usize,
        }
    }

    fn assemble(self) -> Vec<u8> {
        self.fragments.into_iter().flatten().flatten().collect()
    }
}

/// Ordered, exactly-once message delivery over an unreliable link.
///
/// Both directions of one link live here: the send queue keeps every message
/// until the peer's cumulative acknowledgment covers it, and the receive side
/// buffers out-of-order messages until the gap before them is filled.
#[derive(Debug)]
pub struct ReliableChannel {
    owner: u32,
    config: ReliableConfig,
    fragment_size: usize,

    last_assigned: u32,
    send_queue: VecDeque<OutgoingMessage>,
    outstanding_bytes: usize,

    last_delivered: u32,
    incoming: HashMap<u32, IncomingMessage>,
    delivered: VecDeque<Vec<u8>>,
    ack_pending: bool,
}

impl ReliableChannel {
    /// `owner` is the client number reported in link errors.
    pub fn new(owner: u32, config: ReliableConfig) -> Self {
        let fragment_size = config.fragment_size.clamp(1, MAX_FRAGMENT_PAYLOAD);
        Self {
            owner,
            config,
            fragment_size,
            last_assigned: 0,
            send_queue: VecDeque::new(),
            outstanding_bytes: 0,
            last_delivered: 0,
            incoming: HashMap::new(),
            delivered: VecDeque::new(),
            ack_pending: false,
        }
    }

    pub fn set_owner(&mut self, owner: u32) {
        self.owner = owner;
    }

    /// Queue `payload` for delivery and return its sequence number.
    pub fn enqueue(&mut self, payload: &[u8]) -> Result<u32> {
        if self.outstanding_bytes + payload.len() > self.config.max_outstanding_bytes {
            return Err(SyncError::ChannelOverflow {
                outstanding: self.outstanding_bytes,
                limit: self.config.max_outstanding_bytes,
            });
        }

        let fragment_count = payload.len().div_ceil(self.fragment_size).max(1);
        if fragment_count > self.config.max_fragments as usize {
            return Err(SyncError::MalformedMessage(format!(
                "{} byte message needs {fragment_count} fragments, limit is {}",
                payload.len(),
                self.config.max_fragments
            )));
        }

        let fragments = if payload.is_empty() {
            vec![Vec::new()]
        } else {
            payload
                .chunks(self.fragment_size)
                .map(<[u8]>::to_vec)
                .collect()
        };

        let sequence = next_sequence(self.last_assigned);
        self.last_assigned = sequence;
        self.outstanding_bytes += payload.len();
        self.send_queue.push_back(OutgoingMessage {
            sequence,
            fragments,
            bytes: payload.len(),
            last_sent: None,
            sends: 0,
        });
        Ok(sequence)
    }

    pub fn resend_interval(&self, rtt: Option<Duration>) -> Duration {
        let min = self.config.resend_min();
        let max = self.config.resend_max();
        rtt.map_or(min, |rtt| rtt.saturating_mul(2)).clamp(min, max)
    }

    /// Fragments that are due for a first send or a retransmission at `now`.
    ///
    /// Fails with `LinkTimeout` once a message has used up its retry ceiling.
    pub fn collect_due(
        &mut self,
        now: Instant,
        rtt: Option<Duration>,
    ) -> Result<Vec<ReliableFragment>> {
        let interval = self.resend_interval(rtt);
        let mut due = Vec::new();

        for message in &mut self.send_queue {
            let is_due = message
                .last_sent
                .is_none_or(|sent| now.saturating_duration_since(sent) >= interval);
            if !is_due {
                continue;
            }
            if message.sends > self.config.max_retries {
                return Err(SyncError::LinkTimeout {
                    client_num: self.owner,
                });
            }

            message.last_sent = Some(now);
            message.sends += 1;

            let fragment_count = message.fragments.len() as u16;
            due.extend(
                message
                    .fragments
                    .iter()
                    .enumerate()
                    .map(|(index, data)| ReliableFragment {
                        sequence: message.sequence,
                        fragment_index: index as u16,
                        fragment_count,
                        data: data.clone(),
                    }),
            );
        }

        Ok(due)
    }

    /// Drop every queued message covered by the cumulative acknowledgment `ack`.
    pub fn process_ack(&mut self, ack: u32) -> usize {
        if ack == 0 || sequence_greater_than(ack, self.last_assigned) {
            return 0;
        }

        let mut acked = 0;
        while let Some(front) = self.send_queue.front() {
            if sequence_greater_than(front.sequence, ack) {
                break;
            }
            if let Some(message) = self.send_queue.pop_front() {
                self.outstanding_bytes -= message.bytes;
                acked += 1;
            }
        }
        acked
    }

    pub fn receive_fragment(&mut self, fragment: ReliableFragment) -> Result<()> {
        let ReliableFragment {
            sequence,
            fragment_index,
            fragment_count,
            data,
        } = fragment;

        if sequence == 0
            || fragment_count == 0
            || fragment_index >= fragment_count
            || fragment_count > self.config.max_fragments
            || data.len() > MAX_FRAGMENT_PAYLOAD
        {
            return Err(SyncError::MalformedMessage(format!(
                "fragment {fragment_index}/{fragment_count} of sequence {sequence} ({} bytes)",
                data.len()
            )));
        }

        if !sequence_greater_than(sequence, self.last_delivered) {
            // Already delivered: the peer missed our acknowledgment.
            self.ack_pending = true;
            return Ok(());
        }

        if sequence.wrapping_sub(self.last_delivered) > self.config.receive_window {
            return Err(SyncError::SequenceGapUnresolvable {
                expected: next_sequence(self.last_delivered),
                received: sequence,
            });
        }

        let message = self
            .incoming
            .entry(sequence)
            .or_insert_with(|| IncomingMessage::new(fragment_count));
        if message.fragments.len() != fragment_count as usize {
            return Err(SyncError::MalformedMessage(format!(
                "sequence {sequence} changed fragment count to {fragment_count}"
            )));
        }

        self.ack_pending = true;
        let slot = &mut message.fragments[fragment_index as usize];
        if slot.is_none() {
            *slot = Some(data);
            message.missing -= 1;
        }

        self.deliver_contiguous();
        Ok(())
    }

    fn deliver_contiguous(&mut self) {
        loop {
            let sequence = next_sequence(self.last_delivered);
            if self.incoming.get(&sequence).is_none_or(|m| m.missing > 0) {
                break;
            }
            if let Some(message) = self.incoming.remove(&sequence) {
                self.delivered.push_back(message.assemble());
                self.last_delivered = sequence;
            }
        }
    }

    pub fn drain_delivered(&mut self) -> impl Iterator<Item = Vec<u8>> + '_ {
        self.delivered.drain(..)
    }

    /// Highest contiguously delivered sequence, 0 before the first delivery.
    pub fn ack_sequence(&self) -> u32 {
        self.last_delivered
    }

    /// Whether new reliable data arrived since the last call.
    pub fn take_ack_pending(&mut self) -> bool {
        std::mem::take(&mut self.ack_pending)
    }

    pub fn outstanding_bytes(&self) -> usize {
        self.outstanding_bytes
    }

    pub fn unacked_messages(&self) -> usize {
        self.send_queue.len()
    }

    pub fn reset(&mut self) {
        self.last_assigned = 0;
        self.send_queue.clear();
        self.outstanding_bytes = 0;
        self.last_delivered = 0;
        self.incoming.clear();
        self.delivered.clear();
        self.ack_pending = false;
    }
}
