use std::collections::{BTreeMap, HashMap};
use std::mem;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::config::{PeerConfig, ReliableConfig};
use crate::error::{Result, SyncError};

use super::protocol::{
    InputFrame, MAX_PACKET_SIZE, PACKET_OVERHEAD, Packet, PacketHeader, PacketType,
    sequence_greater_than,
};
use super::reliable::ReliableChannel;
use super::stats::{LossWindow, NetworkStats, RateMeter};
use super::tracking::{AckTracker, ReceiveTracker};
use super::transport::Transport;

const MAX_TRACKED_PACKETS: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Connecting,
    Active,
    Disconnecting,
    TimedOut,
    Closed,
}

impl PeerState {
    pub fn is_live(self) -> bool {
        matches!(self, PeerState::Connecting | PeerState::Active)
    }
}

#[derive(Debug)]
pub struct PeerConnection {
    addr: SocketAddr,
    client_num: u32,
    state: PeerState,
    client_salt: u64,
    server_salt: u64,
    config: PeerConfig,

    send_sequence: u32,
    ack_tracker: AckTracker,
    receive_tracker: ReceiveTracker,
    loss: LossWindow,
    incoming_rate: RateMeter,
    outgoing_rate: RateMeter,
    reliable: ReliableChannel,
    stats: NetworkStats,

    last_packet_time: Instant,
    last_send_time: Option<Instant>,
    last_input_time: Option<Instant>,
    prediction_offset_ms: u32,

    last_acked_snapshot: Option<u32>,
    /// Set by a forced resync until a full snapshot has gone out.
    resync_pending: bool,
    /// Acknowledgments below this predate the last forced full snapshot.
    ack_floor: Option<u32>,
    latest_input: Option<InputFrame>,
    last_consumed_input: Option<u32>,
}

impl PeerConnection {
    pub fn new(
        addr: SocketAddr,
        client_num: u32,
        client_salt: u64,
        server_salt: u64,
        config: PeerConfig,
        reliable: ReliableConfig,
        now: Instant,
    ) -> Self {
        Self {
            addr,
            client_num,
            state: PeerState::Connecting,
            client_salt,
            server_salt,
            send_sequence: 0,
            ack_tracker: AckTracker::new(MAX_TRACKED_PACKETS),
            receive_tracker: ReceiveTracker::new(),
            loss: LossWindow::new(config.loss_window),
            incoming_rate: RateMeter::new(config.rate_window()),
            outgoing_rate: RateMeter::new(config.rate_window()),
            reliable: ReliableChannel::new(client_num, reliable),
            stats: NetworkStats::default(),
            last_packet_time: now,
            last_send_time: None,
            last_input_time: None,
            prediction_offset_ms: 0,
            last_acked_snapshot: None,
            resync_pending: false,
            ack_floor: None,
            latest_input: None,
            last_consumed_input: None,
            config,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn client_num(&self) -> u32 {
        self.client_num
    }

    pub fn set_client_num(&mut self, client_num: u32) {
        self.client_num = client_num;
        self.reliable.set_owner(client_num);
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == PeerState::Active
    }

    pub fn activate(&mut self, now: Instant) {
        if self.state == PeerState::Connecting {
            self.state = PeerState::Active;
            self.last_packet_time = now;
        }
    }

    pub fn client_salt(&self) -> u64 {
        self.client_salt
    }

    pub fn set_client_salt(&mut self, salt: u64) {
        self.client_salt = salt;
    }

    pub fn server_salt(&self) -> u64 {
        self.server_salt
    }

    pub fn set_server_salt(&mut self, salt: u64) {
        self.server_salt = salt;
    }

    pub fn combined_salt(&self) -> u64 {
        self.client_salt ^ self.server_salt
    }

    pub fn stats(&self) -> &NetworkStats {
        &self.stats
    }

    fn next_header(&mut self, now: Instant) -> PacketHeader {
        self.send_sequence = self.send_sequence.wrapping_add(1);
        if self.send_sequence == 0 {
            self.send_sequence = 1;
        }
        self.ack_tracker.track_packet(self.send_sequence, now);

        let (ack, ack_bitfield) = self.receive_tracker.ack_data();
        PacketHeader::new(
            self.send_sequence,
            ack,
            ack_bitfield,
            self.reliable.ack_sequence(),
        )
    }

    /// Encoded size `payload` would have on the wire.
    pub fn encoded_size(payload: &PacketType) -> Option<usize> {
        Packet::new(PacketHeader::unsequenced(), payload.clone())
            .serialize()
            .ok()
            .map(|bytes| bytes.len())
    }

    /// Send a sequenced packet. Failures are logged and reported as `false`.
    pub fn send(&mut self, transport: &mut dyn Transport, payload: PacketType, now: Instant) -> bool {
        let header = self.next_header(now);
        let bytes = match Packet::new(header, payload).serialize() {
            Ok(bytes) => bytes,
            Err(e) => {
                log::warn!("dropping packet to client {}: {e}", self.client_num);
                return false;
            }
        };
        self.send_raw(transport, &bytes, now)
    }

    /// Send a packet outside the sequenced stream (handshake traffic).
    pub fn send_unsequenced(
        &mut self,
        transport: &mut dyn Transport,
        payload: PacketType,
        now: Instant,
    ) -> bool {
        match Packet::new(PacketHeader::unsequenced(), payload).serialize() {
            Ok(bytes) => self.send_raw(transport, &bytes, now),
            Err(e) => {
                log::warn!("dropping handshake packet to {}: {e}", self.addr);
                false
            }
        }
    }

    fn send_raw(&mut self, transport: &mut dyn Transport, bytes: &[u8], now: Instant) -> bool {
        match transport.send(self.addr, bytes) {
            Ok(sent) => {
                self.outgoing_rate.record(now, sent);
                self.last_send_time = Some(now);
                self.stats.packets_sent += 1;
                self.stats.bytes_sent += sent as u64;
                true
            }
            Err(e) => {
                log::warn!("send to {} failed: {e}", self.addr);
                false
            }
        }
    }

    /// Account for a sequenced packet from this peer and hand back its payload.
    ///
    /// Duplicates yield `None`.
    pub fn receive(&mut self, packet: Packet, size: usize, now: Instant) -> Option<PacketType> {
        let header = packet.header;
        let Some(arrival) = self.receive_tracker.record_received(header.sequence) else {
            self.stats.packets_dropped += 1;
            return None;
        };

        self.loss.record(header.sequence, arrival);
        self.ack_tracker
            .process_ack(header.ack, header.ack_bitfield, now);
        self.reliable.process_ack(header.reliable_ack);
        self.incoming_rate.record(now, size);
        self.last_packet_time = now;
        self.stats.packets_received += 1;
        self.stats.bytes_received += size as u64;

        Some(packet.payload)
    }

    /// Resets the timeout clock for traffic that bypasses `receive`.
    pub fn touch(&mut self, now: Instant) {
        self.last_packet_time = now;
    }

    pub fn send_reliable(&mut self, payload: &[u8]) -> Result<u32> {
        if !self.is_active() {
            return Err(SyncError::PeerNotActive(self.client_num));
        }
        self.reliable.enqueue(payload)
    }

    pub fn reliable(&mut self) -> &mut ReliableChannel {
        &mut self.reliable
    }

    pub fn rtt(&self) -> Option<Duration> {
        self.ack_tracker
            .srtt()
            .map(|ms| Duration::from_secs_f32(ms.max(0.0) / 1000.0))
    }

    /// Push due reliable fragments and, when nothing else went out, an ack or keepalive.
    pub fn flush(&mut self, transport: &mut dyn Transport, now: Instant) -> Result<()> {
        let due = self.reliable.collect_due(now, self.rtt())?;

        let budget = MAX_PACKET_SIZE - PACKET_OVERHEAD;
        let mut batch = Vec::new();
        let mut used = 0;
        for fragment in due {
            let size = fragment.wire_size();
            if !batch.is_empty() && used + size > budget {
                self.send(transport, PacketType::Reliable(mem::take(&mut batch)), now);
                used = 0;
            }
            used += size;
            batch.push(fragment);
        }
        if !batch.is_empty() {
            self.send(transport, PacketType::Reliable(batch), now);
        }

        let ack_pending = self.reliable.take_ack_pending();
        let sent_this_tick = self.last_send_time == Some(now);
        let keepalive_due = self
            .last_send_time
            .is_none_or(|sent| now.saturating_duration_since(sent) >= self.config.keepalive());
        if !sent_this_tick && (ack_pending || keepalive_due) {
            self.send(transport, PacketType::Ack, now);
        }
        Ok(())
    }

    /// Moves a live peer to `TimedOut` once it has been silent past the ceiling.
    pub fn check_timeout(&mut self, now: Instant) -> bool {
        if self.state.is_live()
            && now.saturating_duration_since(self.last_packet_time) > self.config.timeout()
        {
            self.state = PeerState::TimedOut;
            return true;
        }
        false
    }

    pub fn begin_disconnect(&mut self, transport: &mut dyn Transport, now: Instant) {
        if self.state.is_live() {
            self.send(transport, PacketType::Disconnect, now);
            self.state = PeerState::Disconnecting;
        }
    }

    /// Final state: drops the reliable channel contents and every snapshot reference.
    pub fn close(&mut self) {
        self.state = PeerState::Closed;
        self.reliable.reset();
        self.last_acked_snapshot = None;
        self.resync_pending = false;
        self.ack_floor = None;
        self.latest_input = None;
        self.incoming_rate.reset();
        self.outgoing_rate.reset();
        self.loss.reset();
    }

    /// Keeps only the newest input; returns whether `frame` superseded the stored one.
    ///
    /// The snapshot acknowledgment is honoured even for stale frames. Sequence 0
    /// carries only the acknowledgment and the prediction offset.
    pub fn record_input(&mut self, frame: InputFrame, now: Instant) -> bool {
        if let Some(acked) = frame.acked_snapshot {
            self.acknowledge_snapshot(acked);
        }
        if frame.request_full && !self.resync_pending {
            log::debug!("client {} asked for a full snapshot", self.client_num);
            self.force_full_snapshot();
        }

        let stale = |sequence: u32| !sequence_greater_than(frame.sequence, sequence);
        if frame.sequence != 0
            && (self.last_consumed_input.is_some_and(stale)
                || self.latest_input.as_ref().is_some_and(|held| stale(held.sequence)))
        {
            return false;
        }

        self.prediction_offset_ms = frame.prediction_ms;
        if frame.sequence == 0 {
            return false;
        }
        self.last_input_time = Some(now);
        self.latest_input = Some(frame);
        true
    }

    pub fn take_input(&mut self) -> Option<InputFrame> {
        let frame = self.latest_input.take()?;
        self.last_consumed_input = Some(frame.sequence);
        Some(frame)
    }

    pub fn last_consumed_input(&self) -> Option<u32> {
        self.last_consumed_input
    }

    pub fn acknowledge_snapshot(&mut self, sequence: u32) {
        if self.resync_pending
            || self
                .ack_floor
                .is_some_and(|floor| sequence_greater_than(floor, sequence))
        {
            return;
        }
        let newer = self
            .last_acked_snapshot
            .is_none_or(|known| sequence_greater_than(sequence, known));
        if newer {
            self.last_acked_snapshot = Some(sequence);
        }
    }

    pub fn last_acked_snapshot(&self) -> Option<u32> {
        self.last_acked_snapshot
    }

    /// Forget the delta base so the next snapshot is sent in full.
    ///
    /// Acknowledgments are ignored until that full snapshot has been sent, and
    /// afterwards any that predate it.
    pub fn force_full_snapshot(&mut self) {
        self.last_acked_snapshot = None;
        self.resync_pending = true;
    }

    pub fn resync_pending(&self) -> bool {
        self.resync_pending
    }

    pub fn record_snapshot_sent(&mut self, sequence: u32, full: bool) {
        if full && self.resync_pending {
            self.resync_pending = false;
            self.ack_floor = Some(sequence);
        }
    }

    pub fn set_prediction_offset(&mut self, offset_ms: u32) {
        self.prediction_offset_ms = offset_ms;
    }

    pub fn can_send(&self, now: Instant, bytes: usize) -> bool {
        !self
            .outgoing_rate
            .would_exceed(now, bytes, self.config.max_outgoing_rate)
    }

    pub fn record_skipped_snapshot(&mut self) {
        self.stats.snapshots_skipped += 1;
    }

    pub fn ping(&self) -> u32 {
        if !self.is_active() {
            return 0;
        }
        self.ack_tracker.srtt().map_or(0, |ms| ms.round() as u32)
    }

    pub fn prediction_offset(&self) -> u32 {
        if !self.is_active() {
            return 0;
        }
        self.prediction_offset_ms
    }

    pub fn time_since_last_packet(&self, now: Instant) -> u32 {
        if !self.is_active() {
            return 0;
        }
        millis(now.saturating_duration_since(self.last_packet_time))
    }

    pub fn time_since_last_input(&self, now: Instant) -> u32 {
        if !self.is_active() {
            return 0;
        }
        self.last_input_time
            .map_or(0, |at| millis(now.saturating_duration_since(at)))
    }

    pub fn outgoing_rate(&self, now: Instant) -> u32 {
        if !self.is_active() {
            return 0;
        }
        self.outgoing_rate.rate(now) as u32
    }

    pub fn incoming_rate(&self, now: Instant) -> u32 {
        if !self.is_active() {
            return 0;
        }
        self.incoming_rate.rate(now) as u32
    }

    /// Fraction of packets lost over the sample window.
    pub fn incoming_packet_loss(&self) -> f32 {
        if !self.is_active() {
            return 0.0;
        }
        self.loss.loss()
    }
}

fn millis(duration: Duration) -> u32 {
    duration.as_millis().min(u32::MAX as u128) as u32
}

#[derive(Debug)]
pub struct PeerTable {
    peers_by_addr: HashMap<SocketAddr, u32>,
    peers: BTreeMap<u32, PeerConnection>,
    next_client_num: u32,
    max_clients: usize,
}

impl PeerTable {
    pub fn new(max_clients: usize) -> Self {
        Self {
            peers_by_addr: HashMap::new(),
            peers: BTreeMap::new(),
            next_client_num: 1,
            max_clients,
        }
    }

    /// Existing peer for `addr`, or a fresh `Connecting` one built by `create`.
    pub fn get_or_create_pending(
        &mut self,
        addr: SocketAddr,
        create: impl FnOnce(u32) -> PeerConnection,
    ) -> Result<(&mut PeerConnection, bool)> {
        if let Some(&client_num) = self.peers_by_addr.get(&addr) {
            return self
                .peers
                .get_mut(&client_num)
                .map(|peer| (peer, false))
                .ok_or(SyncError::UnknownPeer(client_num));
        }

        if self.peers.len() >= self.max_clients {
            return Err(SyncError::ServerFull);
        }

        let client_num = self.next_client_num;
        self.next_client_num += 1;
        self.peers_by_addr.insert(addr, client_num);
        Ok((self.peers.entry(client_num).or_insert(create(client_num)), true))
    }

    pub fn client_num(&self, addr: &SocketAddr) -> Option<u32> {
        self.peers_by_addr.get(addr).copied()
    }

    pub fn get(&self, client_num: u32) -> Option<&PeerConnection> {
        self.peers.get(&client_num)
    }

    pub fn get_mut(&mut self, client_num: u32) -> Option<&mut PeerConnection> {
        self.peers.get_mut(&client_num)
    }

    pub fn get_by_addr_mut(&mut self, addr: &SocketAddr) -> Option<&mut PeerConnection> {
        let client_num = *self.peers_by_addr.get(addr)?;
        self.peers.get_mut(&client_num)
    }

    pub fn remove(&mut self, client_num: u32) -> Option<PeerConnection> {
        let peer = self.peers.remove(&client_num)?;
        self.peers_by_addr.remove(&peer.addr);
        Some(peer)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerConnection> {
        self.peers.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut PeerConnection> {
        self.peers.values_mut()
    }

    pub fn client_nums(&self) -> Vec<u32> {
        self.peers.keys().copied().collect()
    }

    pub fn active_count(&self) -> usize {
        self.peers.values().filter(|p| p.is_active()).count()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::simulator::MemoryNetwork;
    use crate::net::transport::Transport;

    fn peer(addr: SocketAddr, now: Instant) -> PeerConnection {
        PeerConnection::new(
            addr,
            1,
            0xAA,
            0x55,
            PeerConfig::default(),
            ReliableConfig::default(),
            now,
        )
    }

    fn input(sequence: u32) -> InputFrame {
        InputFrame {
            sequence,
            prediction_ms: sequence * 10,
            acked_snapshot: Some(sequence),
            request_full: false,
            payload: vec![sequence as u8],
        }
    }

    #[test]
    fn inactive_peer_reports_neutral_metrics() {
        let now = Instant::now();
        let mut p = peer("127.0.0.1:9".parse().unwrap(), now);
        p.record_input(input(3), now);

        let later = now + Duration::from_secs(3);
        assert_eq!(p.ping(), 0);
        assert_eq!(p.prediction_offset(), 0);
        assert_eq!(p.time_since_last_packet(later), 0);
        assert_eq!(p.time_since_last_input(later), 0);
        assert_eq!(p.outgoing_rate(later), 0);
        assert_eq!(p.incoming_rate(later), 0);
        assert_eq!(p.incoming_packet_loss(), 0.0);
        assert!(matches!(
            p.send_reliable(b"x"),
            Err(SyncError::PeerNotActive(1))
        ));
    }

    #[test]
    fn fresh_active_peer_has_no_loss() {
        let now = Instant::now();
        let mut p = peer("127.0.0.1:9".parse().unwrap(), now);
        p.activate(now);
        assert_eq!(p.incoming_packet_loss(), 0.0);
        assert!(!p.incoming_packet_loss().is_nan());
        assert_eq!(p.ping(), 0);
    }

    #[test]
    fn only_the_newest_input_is_kept() {
        let now = Instant::now();
        let mut p = peer("127.0.0.1:9".parse().unwrap(), now);
        p.activate(now);

        assert!(p.record_input(input(2), now));
        assert!(!p.record_input(input(1), now));
        assert!(p.record_input(input(5), now));
        assert_eq!(p.prediction_offset(), 50);
        assert_eq!(p.last_acked_snapshot(), Some(5));

        assert_eq!(p.take_input().map(|f| f.sequence), Some(5));
        assert!(p.take_input().is_none());
        assert!(!p.record_input(input(4), now));
    }

    #[test]
    fn ack_only_frames_move_the_snapshot_cursor() {
        let now = Instant::now();
        let mut p = peer("127.0.0.1:9".parse().unwrap(), now);
        p.activate(now);

        let ack_only = InputFrame {
            sequence: 0,
            prediction_ms: 16,
            acked_snapshot: Some(9),
            request_full: false,
            payload: Vec::new(),
        };
        assert!(!p.record_input(ack_only, now));
        assert_eq!(p.last_acked_snapshot(), Some(9));
        assert_eq!(p.prediction_offset(), 16);
        assert!(p.take_input().is_none());
        assert_eq!(p.time_since_last_input(now + Duration::from_secs(1)), 0);
    }

    #[test]
    fn forced_resync_ignores_acks_that_predate_it() {
        let now = Instant::now();
        let mut p = peer("127.0.0.1:9".parse().unwrap(), now);
        p.activate(now);
        p.acknowledge_snapshot(10);

        p.force_full_snapshot();
        p.acknowledge_snapshot(11);
        assert_eq!(p.last_acked_snapshot(), None);

        p.record_snapshot_sent(12, false);
        assert!(p.resync_pending());
        p.record_snapshot_sent(13, true);
        assert!(!p.resync_pending());

        p.acknowledge_snapshot(12);
        assert_eq!(p.last_acked_snapshot(), None);
        p.acknowledge_snapshot(13);
        assert_eq!(p.last_acked_snapshot(), Some(13));
    }

    #[test]
    fn clients_can_ask_for_a_full_snapshot() {
        let now = Instant::now();
        let mut p = peer("127.0.0.1:9".parse().unwrap(), now);
        p.activate(now);
        p.acknowledge_snapshot(4);

        let request = InputFrame {
            sequence: 0,
            prediction_ms: 0,
            acked_snapshot: None,
            request_full: true,
            payload: Vec::new(),
        };
        p.record_input(request, now);
        assert_eq!(p.last_acked_snapshot(), None);
        assert!(p.resync_pending());
    }

    #[test]
    fn silence_times_out() {
        let now = Instant::now();
        let mut p = peer("127.0.0.1:9".parse().unwrap(), now);
        p.activate(now);

        assert!(!p.check_timeout(now + Duration::from_secs(10)));
        assert!(p.check_timeout(now + Duration::from_millis(10_001)));
        assert_eq!(p.state(), PeerState::TimedOut);
        assert!(!p.check_timeout(now + Duration::from_secs(20)));
    }

    #[test]
    fn packets_carry_acks_both_ways() {
        let network = MemoryNetwork::new(5);
        let mut server_side = network.bind();
        let mut client_side = network.bind();
        let now = Instant::now();

        let mut to_client = peer(client_side.local_addr(), now);
        let mut to_server = peer(server_side.local_addr(), now);
        to_client.activate(now);
        to_server.activate(now);

        to_client.send_reliable(b"hello").unwrap();
        to_client.flush(&mut server_side, now).unwrap();

        let (_, bytes) = client_side.poll().unwrap().unwrap();
        let packet = Packet::deserialize(&bytes).unwrap();
        let Some(PacketType::Reliable(fragments)) = to_server.receive(packet, bytes.len(), now)
        else {
            panic!("expected reliable payload");
        };
        for fragment in fragments {
            to_server.reliable().receive_fragment(fragment).unwrap();
        }
        let delivered: Vec<_> = to_server.reliable().drain_delivered().collect();
        assert_eq!(delivered, vec![b"hello".to_vec()]);

        let later = now + Duration::from_millis(30);
        to_server.flush(&mut client_side, later).unwrap();
        let (_, bytes) = server_side.poll().unwrap().unwrap();
        let packet = Packet::deserialize(&bytes).unwrap();
        assert_eq!(packet.header.reliable_ack, 1);
        assert!(matches!(
            to_client.receive(packet, bytes.len(), later),
            Some(PacketType::Ack)
        ));

        assert_eq!(to_client.reliable().unacked_messages(), 0);
        assert_eq!(to_client.ping(), 30);
        assert!(to_client.incoming_rate(later) > 0);
    }

    #[test]
    fn duplicate_packets_are_ignored() {
        let now = Instant::now();
        let mut p = peer("127.0.0.1:9".parse().unwrap(), now);
        p.activate(now);
        let packet = Packet::new(PacketHeader::new(1, 0, 0, 0), PacketType::Ack);

        assert!(p.receive(packet.clone(), 40, now).is_some());
        assert!(p.receive(packet, 40, now).is_none());
        assert_eq!(p.stats().packets_dropped, 1);
    }

    #[test]
    fn table_denies_when_full() {
        let now = Instant::now();
        let mut table = PeerTable::new(1);
        let a: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let b: SocketAddr = "127.0.0.1:2".parse().unwrap();

        let (first, created) = table.get_or_create_pending(a, |_| peer(a, now)).unwrap();
        assert!(created);
        assert_eq!(first.addr(), a);

        let (_, created) = table.get_or_create_pending(a, |_| peer(a, now)).unwrap();
        assert!(!created);

        assert!(matches!(
            table.get_or_create_pending(b, |_| peer(b, now)),
            Err(SyncError::ServerFull)
        ));

        assert!(table.remove(1).is_some());
        assert!(table.client_num(&a).is_none());
        assert!(table.is_empty());
    }
}
