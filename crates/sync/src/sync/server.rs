use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Instant;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::ServerConfig;
use crate::error::{Result, SyncError};
use crate::net::{
    MAX_SNAPSHOT_PARTS, Packet, PacketHeader, PacketType, PeerConnection, PeerState, PeerTable,
    SnapshotFrame, Transport,
};
use crate::snapshot::{Snapshot, SnapshotHistory, StateMap};

use super::events::{DisconnectReason, ServerEvent};
use super::game::{Game, LOCAL_CLIENT_NUM};

/// Server role: owns every peer link and the authoritative snapshot history.
pub struct SyncCoordinator {
    transport: Box<dyn Transport>,
    config: ServerConfig,
    peers: PeerTable,
    history: SnapshotHistory,
    tick: u64,
    snapshot_sequence: u32,
    started_at: Instant,
    rng: StdRng,
    local_client: bool,
    /// Reliable messages from the in-process client, delivered like peer traffic.
    local_inbox: VecDeque<Vec<u8>>,
    local_outbox: VecDeque<Vec<u8>>,
    events: VecDeque<ServerEvent>,
}

impl SyncCoordinator {
    pub fn new(transport: impl Transport + 'static, config: ServerConfig, now: Instant) -> Self {
        Self::with_rng(transport, config, StdRng::from_entropy(), now)
    }

    /// Deterministic server salts, for tests.
    pub fn with_seed(
        transport: impl Transport + 'static,
        config: ServerConfig,
        seed: u64,
        now: Instant,
    ) -> Self {
        Self::with_rng(transport, config, StdRng::seed_from_u64(seed), now)
    }

    fn with_rng(
        transport: impl Transport + 'static,
        config: ServerConfig,
        rng: StdRng,
        now: Instant,
    ) -> Self {
        log::info!(
            "server listening on {} ({} clients, {} Hz)",
            transport.local_addr(),
            config.max_clients,
            config.tick_rate
        );
        Self {
            transport: Box::new(transport),
            peers: PeerTable::new(config.max_clients),
            history: SnapshotHistory::new(config.snapshot_history),
            tick: 0,
            snapshot_sequence: 0,
            started_at: now,
            rng,
            local_client: false,
            local_inbox: VecDeque::new(),
            local_outbox: VecDeque::new(),
            events: VecDeque::new(),
            config,
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn tick_count(&self) -> u64 {
        self.tick
    }

    pub fn snapshot_sequence(&self) -> u32 {
        self.snapshot_sequence
    }

    pub fn peers(&self) -> &PeerTable {
        &self.peers
    }

    pub fn peer(&self, client_num: u32) -> Option<&PeerConnection> {
        self.peers.get(client_num)
    }

    pub fn history(&self) -> &SnapshotHistory {
        &self.history
    }

    pub fn drain_events(&mut self) -> impl Iterator<Item = ServerEvent> + '_ {
        self.events.drain(..)
    }

    /// Register the client running in this process. It never touches the transport.
    pub fn attach_local_client(&mut self) -> u32 {
        self.local_client = true;
        LOCAL_CLIENT_NUM
    }

    pub fn detach_local_client(&mut self) {
        self.local_client = false;
        self.local_inbox.clear();
        self.local_outbox.clear();
    }

    pub fn has_local_client(&self) -> bool {
        self.local_client
    }

    /// Queue a reliable message from the local client; it is delivered on the
    /// next tick together with the reliable traffic of remote peers.
    pub fn local_client_send_reliable(&mut self, payload: &[u8]) -> Result<()> {
        if !self.local_client {
            return Err(SyncError::UnknownPeer(LOCAL_CLIENT_NUM));
        }
        self.local_inbox.push_back(payload.to_vec());
        Ok(())
    }

    /// Reliable messages the server addressed to the local client, in send order.
    pub fn drain_local_reliable(&mut self) -> impl Iterator<Item = Vec<u8>> + '_ {
        self.local_outbox.drain(..)
    }

    pub fn send_reliable(&mut self, client_num: u32, payload: &[u8], now: Instant) -> Result<()> {
        if client_num == LOCAL_CLIENT_NUM && self.local_client {
            self.local_outbox.push_back(payload.to_vec());
            return Ok(());
        }

        let peer = self
            .peers
            .get_mut(client_num)
            .ok_or(SyncError::UnknownPeer(client_num))?;
        match peer.send_reliable(payload) {
            Ok(_) => Ok(()),
            Err(e @ SyncError::ChannelOverflow { .. }) => {
                log::warn!("client {client_num}: {e}");
                self.remove_peer(client_num, DisconnectReason::Overflow, now);
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Reliable send to every active peer except `excluded`. Every peer is
    /// attempted; the first failure is returned.
    pub fn send_reliable_excluding(
        &mut self,
        excluded: u32,
        payload: &[u8],
        now: Instant,
    ) -> Result<()> {
        let mut targets: Vec<u32> = self
            .peers
            .iter()
            .filter(|peer| peer.is_active() && peer.client_num() != excluded)
            .map(PeerConnection::client_num)
            .collect();
        if self.local_client && excluded != LOCAL_CLIENT_NUM {
            targets.insert(0, LOCAL_CLIENT_NUM);
        }

        let mut first_error = None;
        for client_num in targets {
            if let Err(e) = self.send_reliable(client_num, payload, now) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    pub fn kick(&mut self, client_num: u32, now: Instant) -> Result<()> {
        if self.peers.get(client_num).is_none() {
            return Err(SyncError::UnknownPeer(client_num));
        }
        self.remove_peer(client_num, DisconnectReason::Kicked, now);
        Ok(())
    }

    pub fn shutdown(&mut self, now: Instant) {
        for client_num in self.peers.client_nums() {
            self.remove_peer(client_num, DisconnectReason::Kicked, now);
        }
        self.detach_local_client();
        log::info!("server shut down after {} ticks", self.tick);
    }

    /// One simulation step: reliable delivery, newest inputs, state capture,
    /// snapshot fan-out, retransmission and timeouts.
    pub fn tick(&mut self, game: &mut dyn Game, now: Instant) {
        self.receive_packets(now);
        self.deliver_reliable(game);
        self.consume_inputs(game);

        let state = game.collect_state();
        self.tick += 1;
        if self.tick % u64::from(self.config.snapshot_interval.max(1)) == 0 {
            self.record_snapshot(state, now);
            self.send_snapshots(now);
        }

        self.flush_peers(now);
        self.check_timeouts(now);
    }

    fn server_time_ms(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.started_at).as_millis() as u64
    }

    fn receive_packets(&mut self, now: Instant) {
        loop {
            match self.transport.poll() {
                Ok(Some((addr, bytes))) => self.handle_datagram(addr, &bytes, now),
                Ok(None) => break,
                Err(e) => {
                    log::warn!("receive failed: {e}");
                    break;
                }
            }
        }
    }

    fn handle_datagram(&mut self, addr: SocketAddr, bytes: &[u8], now: Instant) {
        let packet = match Packet::deserialize(bytes) {
            Ok(packet) => packet,
            Err(e) => {
                log::debug!("dropping malformed datagram from {addr}: {e}");
                return;
            }
        };

        match packet.payload {
            PacketType::ConnectionRequest { client_salt } => {
                self.handle_connection_request(addr, client_salt, now)
            }
            PacketType::ChallengeResponse { combined_salt } => {
                self.handle_challenge_response(addr, combined_salt, now)
            }
            _ => self.handle_peer_packet(addr, packet, bytes.len(), now),
        }
    }

    fn handle_connection_request(&mut self, addr: SocketAddr, client_salt: u64, now: Instant) {
        let server_salt: u64 = self.rng.r#gen();
        let peer_config = self.config.peer.clone();
        let reliable_config = self.config.reliable.clone();

        let created = self.peers.get_or_create_pending(addr, |client_num| {
            PeerConnection::new(
                addr,
                client_num,
                client_salt,
                server_salt,
                peer_config,
                reliable_config,
                now,
            )
        });

        match created {
            Ok((peer, created)) => {
                if peer.is_active() {
                    return;
                }
                if peer.client_salt() != client_salt {
                    peer.set_client_salt(client_salt);
                }
                peer.touch(now);

                let challenge = PacketType::ConnectionChallenge {
                    server_salt: peer.server_salt(),
                    challenge: peer.combined_salt(),
                };
                peer.send_unsequenced(self.transport.as_mut(), challenge, now);

                if created {
                    let client_num = peer.client_num();
                    log::info!("client {client_num} connecting from {addr}");
                    self.events
                        .push_back(ServerEvent::PeerConnecting { client_num, addr });
                }
            }
            Err(e) => {
                let reason = e.to_string();
                log::info!("denying connection from {addr}: {reason}");
                let denial = PacketType::ConnectionDenied {
                    reason: reason.clone(),
                };
                send_unsequenced(self.transport.as_mut(), addr, denial);
                self.events
                    .push_back(ServerEvent::ConnectionDenied { addr, reason });
            }
        }
    }

    fn handle_challenge_response(&mut self, addr: SocketAddr, combined_salt: u64, now: Instant) {
        let Some(peer) = self.peers.get_by_addr_mut(&addr) else {
            log::debug!("challenge response from unknown address {addr}");
            return;
        };
        if combined_salt != peer.combined_salt() {
            log::debug!("rejecting challenge response from {addr}");
            return;
        }

        peer.touch(now);
        let newly_active = peer.state() == PeerState::Connecting;
        peer.activate(now);
        if !peer.is_active() {
            return;
        }

        let client_num = peer.client_num();
        peer.send_unsequenced(
            self.transport.as_mut(),
            PacketType::ConnectionAccepted { client_num },
            now,
        );
        if newly_active {
            log::info!("client {client_num} connected from {addr}");
            self.events
                .push_back(ServerEvent::PeerConnected { client_num, addr });
        }
    }

    fn handle_peer_packet(&mut self, addr: SocketAddr, packet: Packet, size: usize, now: Instant) {
        let Some(peer) = self.peers.get_by_addr_mut(&addr) else {
            log::debug!("dropping packet from unknown address {addr}");
            return;
        };
        if !peer.is_active() {
            return;
        }
        let client_num = peer.client_num();
        let Some(payload) = peer.receive(packet, size, now) else {
            return;
        };

        match payload {
            PacketType::Reliable(fragments) => {
                let mut desynced = false;
                for fragment in fragments {
                    match peer.reliable().receive_fragment(fragment) {
                        Ok(()) => {}
                        Err(e @ SyncError::SequenceGapUnresolvable { .. }) => {
                            log::warn!("client {client_num} desynced, forcing full snapshot: {e}");
                            desynced = true;
                        }
                        Err(e) => {
                            log::debug!("dropping reliable fragment from client {client_num}: {e}")
                        }
                    }
                }
                if desynced && !peer.resync_pending() {
                    peer.force_full_snapshot();
                    self.events.push_back(ServerEvent::PeerResync { client_num });
                }
            }
            PacketType::Input(frame) => {
                peer.record_input(frame, now);
            }
            PacketType::Disconnect => {
                self.remove_peer(client_num, DisconnectReason::Graceful, now);
            }
            PacketType::Ack => {}
            _ => log::debug!("unexpected packet from client {client_num}"),
        }
    }

    fn deliver_reliable(&mut self, game: &mut dyn Game) {
        for payload in self.local_inbox.drain(..) {
            game.consume_reliable(LOCAL_CLIENT_NUM, &payload);
        }
        for peer in self.peers.iter_mut().filter(|peer| peer.is_active()) {
            let client_num = peer.client_num();
            for payload in peer.reliable().drain_delivered() {
                game.consume_reliable(client_num, &payload);
            }
        }
    }

    fn consume_inputs(&mut self, game: &mut dyn Game) {
        for peer in self.peers.iter_mut().filter(|peer| peer.is_active()) {
            if let Some(frame) = peer.take_input() {
                game.consume_input(peer.client_num(), &frame.payload);
            }
        }
    }

    fn record_snapshot(&mut self, state: StateMap, now: Instant) {
        self.snapshot_sequence = match self.snapshot_sequence.wrapping_add(1) {
            0 => 1,
            next => next,
        };
        let time = self.server_time_ms(now);
        self.history.push(self.snapshot_sequence, time, state);

        let peers = &self.peers;
        self.history.evict(self.config.max_delta_age, |sequence| {
            peers
                .iter()
                .any(|peer| peer.last_acked_snapshot() == Some(sequence))
        });
    }

    fn send_snapshots(&mut self, now: Instant) {
        let Some(latest) = self.history.latest() else {
            return;
        };
        let max_age = self.config.max_delta_age;

        for peer in self.peers.iter_mut().filter(|peer| peer.is_active()) {
            let base = peer
                .last_acked_snapshot()
                .filter(|base| latest.sequence.wrapping_sub(*base) <= max_age)
                .and_then(|base| self.history.state(base).map(|state| (base, state)));

            let snapshot = match base {
                Some((base, base_state)) => Snapshot::delta(
                    latest.sequence,
                    latest.server_time_ms,
                    base,
                    base_state,
                    &latest.state,
                ),
                None => Snapshot::full(latest.sequence, latest.server_time_ms, &latest.state),
            };
            let full = snapshot.is_full();
            let sequence = snapshot.sequence;

            let Some(frames) = snapshot_frames(snapshot, peer.last_consumed_input()) else {
                log::warn!(
                    "snapshot {sequence} for client {} cannot be split into {MAX_SNAPSHOT_PARTS} packets",
                    peer.client_num()
                );
                peer.record_skipped_snapshot();
                continue;
            };
            let total: usize = frames.iter().map(|(_, size)| size).sum();
            if !peer.can_send(now, total) {
                log::debug!("client {} over its rate budget, skipping snapshot", peer.client_num());
                peer.record_skipped_snapshot();
                continue;
            }
            for (payload, _) in frames {
                peer.send(self.transport.as_mut(), payload, now);
            }
            peer.record_snapshot_sent(sequence, full);
        }
    }

    fn flush_peers(&mut self, now: Instant) {
        let mut failed = Vec::new();
        for peer in self.peers.iter_mut().filter(|peer| peer.is_active()) {
            if let Err(e) = peer.flush(self.transport.as_mut(), now) {
                failed.push((peer.client_num(), e));
            }
        }

        for (client_num, e) in failed {
            log::warn!("link to client {client_num} failed: {e}");
            let reason = match e {
                SyncError::ChannelOverflow { .. } => DisconnectReason::Overflow,
                _ => DisconnectReason::Timeout,
            };
            self.remove_peer(client_num, reason, now);
        }
    }

    fn check_timeouts(&mut self, now: Instant) {
        let timed_out: Vec<u32> = self
            .peers
            .iter_mut()
            .filter_map(|peer| peer.check_timeout(now).then(|| peer.client_num()))
            .collect();
        for client_num in timed_out {
            self.remove_peer(client_num, DisconnectReason::Timeout, now);
        }
    }

    fn remove_peer(&mut self, client_num: u32, reason: DisconnectReason, now: Instant) {
        let Some(mut peer) = self.peers.remove(client_num) else {
            return;
        };
        if matches!(reason, DisconnectReason::Kicked | DisconnectReason::Overflow) {
            peer.begin_disconnect(self.transport.as_mut(), now);
        }
        peer.close();

        log::info!("client {client_num} {reason}");
        self.events
            .push_back(ServerEvent::PeerDisconnected { client_num, reason });
    }

    pub fn client_ping(&self, client_num: u32) -> u32 {
        self.peers.get(client_num).map_or(0, PeerConnection::ping)
    }

    pub fn client_prediction(&self, client_num: u32) -> u32 {
        self.peers
            .get(client_num)
            .map_or(0, PeerConnection::prediction_offset)
    }

    pub fn client_time_since_last_packet(&self, client_num: u32, now: Instant) -> u32 {
        self.peers
            .get(client_num)
            .map_or(0, |peer| peer.time_since_last_packet(now))
    }

    pub fn client_time_since_last_input(&self, client_num: u32, now: Instant) -> u32 {
        self.peers
            .get(client_num)
            .map_or(0, |peer| peer.time_since_last_input(now))
    }

    pub fn client_outgoing_rate(&self, client_num: u32, now: Instant) -> u32 {
        self.peers
            .get(client_num)
            .map_or(0, |peer| peer.outgoing_rate(now))
    }

    pub fn client_incoming_rate(&self, client_num: u32, now: Instant) -> u32 {
        self.peers
            .get(client_num)
            .map_or(0, |peer| peer.incoming_rate(now))
    }

    pub fn client_incoming_packet_loss(&self, client_num: u32) -> f32 {
        self.peers
            .get(client_num)
            .map_or(0.0, PeerConnection::incoming_packet_loss)
    }
}

/// Encode `snapshot` as one or more datagram payloads with their wire sizes.
fn snapshot_frames(snapshot: Snapshot, input_ack: Option<u32>) -> Option<Vec<(PacketType, usize)>> {
    let frame = |snapshot: Snapshot, part_index: u16, part_count: u16| {
        PacketType::Snapshot(SnapshotFrame {
            snapshot,
            input_ack,
            part_index,
            part_count,
        })
    };
    let fits = |part: &Snapshot| PeerConnection::encoded_size(&frame(part.clone(), 0, 1)).is_some();

    let parts = snapshot.split_to_fit(usize::from(MAX_SNAPSHOT_PARTS), fits)?;
    let part_count = u16::try_from(parts.len()).ok()?;
    parts
        .into_iter()
        .enumerate()
        .map(|(index, part)| {
            let payload = frame(part, index as u16, part_count);
            PeerConnection::encoded_size(&payload).map(|size| (payload, size))
        })
        .collect()
}

fn send_unsequenced(transport: &mut dyn Transport, addr: SocketAddr, payload: PacketType) {
    let bytes = match Packet::new(PacketHeader::unsequenced(), payload).serialize() {
        Ok(bytes) => bytes,
        Err(e) => {
            log::warn!("dropping packet to {addr}: {e}");
            return;
        }
    };
    if let Err(e) = transport.send(addr, &bytes) {
        log::warn!("send to {addr} failed: {e}");
    }
}
