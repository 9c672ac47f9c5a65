use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, VecDeque};
use std::net::SocketAddr;
use std::time::Instant;

use glam::Vec3;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::ClientConfig;
use crate::error::{Result, SyncError};
use crate::net::{
    InputFrame, Packet, PacketType, PeerConnection, SnapshotFrame, Transport,
    sequence_greater_than,
};
use crate::simulation::InputBuffer;
use crate::snapshot::{SnapshotAssembler, SnapshotHistory};

use super::events::ClientEvent;
use super::game::{Game, RemoteMotion};
use super::remote::RemoteTrack;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    /// Waiting for the server's challenge.
    Requesting,
    /// Challenge answered, waiting for acceptance.
    Responding,
    Active,
}

/// Client role: applies server snapshots, replays unacknowledged local input
/// on top of them and smooths remote entities in between.
pub struct PredictionCoordinator {
    transport: Box<dyn Transport>,
    config: ClientConfig,
    state: ClientState,
    link: Option<PeerConnection>,
    last_handshake_send: Option<Instant>,
    inputs: InputBuffer,
    history: SnapshotHistory,
    assembler: SnapshotAssembler,
    /// History was dropped after a desync; only a full snapshot can rebuild it.
    awaiting_full: bool,
    applied: Option<u32>,
    input_ack: Option<u32>,
    remotes: BTreeMap<u32, RemoteTrack>,
    epoch: Instant,
    rng: StdRng,
    events: VecDeque<ClientEvent>,
}

impl PredictionCoordinator {
    pub fn new(transport: impl Transport + 'static, config: ClientConfig, now: Instant) -> Self {
        Self::with_rng(transport, config, StdRng::from_entropy(), now)
    }

    pub fn with_seed(
        transport: impl Transport + 'static,
        config: ClientConfig,
        seed: u64,
        now: Instant,
    ) -> Self {
        Self::with_rng(transport, config, StdRng::seed_from_u64(seed), now)
    }

    fn with_rng(
        transport: impl Transport + 'static,
        config: ClientConfig,
        rng: StdRng,
        now: Instant,
    ) -> Self {
        Self {
            transport: Box::new(transport),
            state: ClientState::Disconnected,
            link: None,
            last_handshake_send: None,
            inputs: InputBuffer::new(config.max_pending_inputs),
            history: SnapshotHistory::new(config.snapshot_history),
            assembler: SnapshotAssembler::new(),
            awaiting_full: false,
            applied: None,
            input_ack: None,
            remotes: BTreeMap::new(),
            epoch: now,
            rng,
            events: VecDeque::new(),
            config,
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == ClientState::Active
    }

    pub fn client_num(&self) -> Option<u32> {
        self.link
            .as_ref()
            .filter(|_| self.is_active())
            .map(PeerConnection::client_num)
    }

    pub fn link(&self) -> Option<&PeerConnection> {
        self.link.as_ref()
    }

    pub fn history(&self) -> &SnapshotHistory {
        &self.history
    }

    /// Sequence of the snapshot the game state was last rebuilt from.
    pub fn applied_snapshot(&self) -> Option<u32> {
        self.applied
    }

    pub fn pending_inputs(&self) -> &InputBuffer {
        &self.inputs
    }

    pub fn drain_events(&mut self) -> impl Iterator<Item = ClientEvent> + '_ {
        self.events.drain(..)
    }

    pub fn connect(&mut self, server_addr: SocketAddr, now: Instant) {
        self.reset();
        let client_salt: u64 = self.rng.r#gen();
        log::info!("connecting to {server_addr}");
        self.link = Some(PeerConnection::new(
            server_addr,
            0,
            client_salt,
            0,
            self.config.peer.clone(),
            self.config.reliable.clone(),
            now,
        ));
        self.state = ClientState::Requesting;
        self.send_handshake(now);
    }

    pub fn disconnect(&mut self, now: Instant) {
        if self.state == ClientState::Disconnected {
            return;
        }
        if let Some(link) = self.link.as_mut() {
            link.begin_disconnect(self.transport.as_mut(), now);
        }
        log::info!("disconnected from server");
        self.reset();
        self.events.push_back(ClientEvent::Disconnected);
    }

    fn reset(&mut self) {
        self.state = ClientState::Disconnected;
        if let Some(link) = self.link.as_mut() {
            link.close();
        }
        self.link = None;
        self.last_handshake_send = None;
        self.inputs.clear();
        self.history.clear();
        self.assembler.clear();
        self.awaiting_full = false;
        self.applied = None;
        self.input_ack = None;
        self.remotes.clear();
    }

    /// Drop every snapshot so the next acknowledgment asks the server for a full one.
    fn resync(&mut self) {
        if self.awaiting_full {
            return;
        }
        log::warn!("requesting a full snapshot from the server");
        self.history.clear();
        self.assembler.clear();
        self.applied = None;
        self.awaiting_full = true;
        self.events.push_back(ClientEvent::Resync);
    }

    pub fn is_resyncing(&self) -> bool {
        self.awaiting_full
    }

    fn lose_connection(&mut self) {
        log::info!("connection to server lost");
        self.reset();
        self.events.push_back(ClientEvent::ConnectionLost);
    }

    fn local_time_ms(&self, now: Instant) -> f32 {
        now.saturating_duration_since(self.epoch).as_secs_f32() * 1000.0
    }

    /// Apply `payload` to the local simulation now and buffer it for the server.
    ///
    /// Without an active connection the input is applied and forgotten, so a
    /// single-player session drives the same call.
    pub fn submit_input(&mut self, game: &mut dyn Game, payload: Vec<u8>, now: Instant) -> u32 {
        let client_num = self.client_num().unwrap_or(0);
        game.consume_input(client_num, &payload);
        if !self.is_active() {
            return 0;
        }
        self.inputs.push(payload, now)
    }

    pub fn send_reliable(&mut self, payload: &[u8]) -> Result<u32> {
        match self.link.as_mut() {
            Some(link) => link.send_reliable(payload),
            None => Err(SyncError::PeerNotActive(0)),
        }
    }

    pub fn tick(&mut self, game: &mut dyn Game, now: Instant) {
        if self.link.is_none() {
            return;
        }
        self.receive_packets(now);

        match self.state {
            ClientState::Requesting | ClientState::Responding => {
                let resend_due = self.last_handshake_send.is_none_or(|sent| {
                    now.saturating_duration_since(sent) >= self.config.handshake_resend()
                });
                if resend_due {
                    self.send_handshake(now);
                }
            }
            ClientState::Active => {
                self.deliver_reliable(game);
                self.apply_newest_snapshot(game, now);
                self.advance_remotes(now);
                self.send_input(now);
                self.flush(now);
            }
            ClientState::Disconnected => return,
        }

        if self.link.as_mut().is_some_and(|link| link.check_timeout(now)) {
            self.lose_connection();
        }
    }

    fn send_handshake(&mut self, now: Instant) {
        let Some(link) = self.link.as_mut() else {
            return;
        };
        let payload = match self.state {
            ClientState::Requesting => PacketType::ConnectionRequest {
                client_salt: link.client_salt(),
            },
            ClientState::Responding => PacketType::ChallengeResponse {
                combined_salt: link.combined_salt(),
            },
            _ => return,
        };
        link.send_unsequenced(self.transport.as_mut(), payload, now);
        self.last_handshake_send = Some(now);
    }

    fn receive_packets(&mut self, now: Instant) {
        loop {
            let (addr, bytes) = match self.transport.poll() {
                Ok(Some(datagram)) => datagram,
                Ok(None) => break,
                Err(e) => {
                    log::warn!("receive failed: {e}");
                    break;
                }
            };
            let Some(server_addr) = self.link.as_ref().map(PeerConnection::addr) else {
                break;
            };
            if addr != server_addr {
                log::debug!("ignoring datagram from {addr}");
                continue;
            }

            let packet = match Packet::deserialize(&bytes) {
                Ok(packet) => packet,
                Err(e) => {
                    log::debug!("dropping malformed datagram from {addr}: {e}");
                    continue;
                }
            };
            if packet.header.sequence == 0 {
                self.handle_handshake(packet.payload, now);
            } else {
                self.handle_link_packet(packet, bytes.len(), now);
            }
        }
    }

    fn handle_handshake(&mut self, payload: PacketType, now: Instant) {
        let state = self.state;
        let Some(link) = self.link.as_mut() else {
            return;
        };

        match payload {
            PacketType::ConnectionChallenge {
                server_salt,
                challenge,
            } if matches!(state, ClientState::Requesting | ClientState::Responding) => {
                if challenge != link.client_salt() ^ server_salt {
                    log::debug!("ignoring challenge with a bad salt");
                    return;
                }
                link.set_server_salt(server_salt);
                link.touch(now);
                self.state = ClientState::Responding;
                self.send_handshake(now);
            }
            PacketType::ConnectionAccepted { client_num } if state == ClientState::Responding => {
                link.set_client_num(client_num);
                link.activate(now);
                self.state = ClientState::Active;
                log::info!("connected as client {client_num}");
                self.events.push_back(ClientEvent::Connected { client_num });
            }
            PacketType::ConnectionDenied { reason } if state != ClientState::Active => {
                log::info!("connection denied: {reason}");
                self.reset();
                self.events.push_back(ClientEvent::Denied { reason });
            }
            _ => {}
        }
    }

    fn handle_link_packet(&mut self, packet: Packet, size: usize, now: Instant) {
        if self.state != ClientState::Active {
            return;
        }
        let Some(link) = self.link.as_mut() else {
            return;
        };
        let Some(payload) = link.receive(packet, size, now) else {
            return;
        };

        match payload {
            PacketType::Snapshot(frame) => self.store_snapshot(frame),
            PacketType::Reliable(fragments) => {
                let mut desynced = false;
                for fragment in fragments {
                    match link.reliable().receive_fragment(fragment) {
                        Ok(()) => {}
                        Err(e @ SyncError::SequenceGapUnresolvable { .. }) => {
                            log::warn!("reliable stream from server desynced: {e}");
                            desynced = true;
                        }
                        Err(e) => log::debug!("dropping reliable fragment: {e}"),
                    }
                }
                if desynced {
                    self.resync();
                }
            }
            PacketType::Disconnect => {
                log::info!("server closed the connection");
                self.reset();
                self.events.push_back(ClientEvent::Disconnected);
            }
            _ => {}
        }
    }

    /// Reconstruct `frame` into the history once all of its parts arrived.
    /// Every snapshot is kept so later deltas can reference it; only the
    /// newest is applied to the game.
    fn store_snapshot(&mut self, frame: SnapshotFrame) {
        let Some(frame) = self.assembler.insert(frame) else {
            return;
        };
        let snapshot = frame.snapshot;
        if self.awaiting_full && !snapshot.is_full() {
            return;
        }
        let base = match snapshot.base_sequence {
            None => None,
            Some(base) => match self.history.state(base) {
                Some(state) => Some(state),
                None => {
                    log::debug!(
                        "snapshot {} references unknown base {base}",
                        snapshot.sequence
                    );
                    return;
                }
            },
        };
        let Some(state) = snapshot.apply(base) else {
            return;
        };

        if self
            .history
            .push(snapshot.sequence, snapshot.server_time_ms, state)
        {
            self.history.trim();
            if snapshot.is_full() {
                self.awaiting_full = false;
            }
            if let Some(ack) = frame.input_ack {
                let newer = self
                    .input_ack
                    .is_none_or(|known| sequence_greater_than(ack, known));
                if newer {
                    self.input_ack = Some(ack);
                }
            }
        }
    }

    fn deliver_reliable(&mut self, game: &mut dyn Game) {
        let Some(link) = self.link.as_mut() else {
            return;
        };
        let client_num = link.client_num();
        for payload in link.reliable().drain_delivered() {
            game.consume_reliable(client_num, &payload);
        }
    }

    /// Rebuild the predicted state: the newest snapshot, then every input the
    /// server has not consumed yet, in order.
    fn apply_newest_snapshot(&mut self, game: &mut dyn Game, now: Instant) {
        let Some(client_num) = self.client_num() else {
            return;
        };
        let Some(latest) = self.history.latest() else {
            return;
        };
        if self.applied == Some(latest.sequence) {
            return;
        }

        let sequence = latest.sequence;
        game.apply_state(&latest.state);
        let motions = game.remote_motion(&latest.state);
        self.applied = Some(sequence);

        if let Some(ack) = self.input_ack {
            self.inputs.acknowledge(ack);
        }
        for input in self.inputs.iter() {
            game.consume_input(client_num, &input.payload);
        }

        self.retarget_remotes(&motions, sequence, now);
    }

    fn retarget_remotes(&mut self, motions: &[RemoteMotion], sequence: u32, now: Instant) {
        let now_ms = self.local_time_ms(now);
        let limit = self.config.extrapolation_limit_ms;
        let blend = self.config.correction_blend_ms;

        for motion in motions {
            match self.remotes.entry(motion.entity) {
                Entry::Occupied(mut track) => {
                    track
                        .get_mut()
                        .retarget(motion, now_ms, limit, blend, sequence)
                }
                Entry::Vacant(slot) => {
                    slot.insert(RemoteTrack::new(motion, now_ms, limit, sequence));
                }
            }
        }
        self.remotes.retain(|_, track| track.last_seen() == sequence);
    }

    fn advance_remotes(&mut self, now: Instant) {
        let now_ms = self.local_time_ms(now);
        for track in self.remotes.values_mut() {
            track.evaluate(now_ms);
        }
    }

    fn send_input(&mut self, now: Instant) {
        let prediction_ms = self.prediction_lead(now);
        let acked_snapshot = self.history.latest().map(|entry| entry.sequence);
        let (sequence, payload) = match self.inputs.latest() {
            Some(input) => (input.sequence, input.payload.clone()),
            None => (0, Vec::new()),
        };
        let Some(link) = self.link.as_mut() else {
            return;
        };
        link.set_prediction_offset(prediction_ms);

        let frame = InputFrame {
            sequence,
            prediction_ms,
            acked_snapshot,
            request_full: self.awaiting_full,
            payload,
        };
        link.send(self.transport.as_mut(), PacketType::Input(frame), now);
    }

    /// How far local simulation runs ahead of the server-acknowledged state.
    fn prediction_lead(&self, now: Instant) -> u32 {
        self.inputs.oldest().map_or(0, |input| {
            now.saturating_duration_since(input.issued_at)
                .as_millis()
                .min(u32::MAX as u128) as u32
        })
    }

    fn flush(&mut self, now: Instant) {
        let Some(link) = self.link.as_mut() else {
            return;
        };
        if let Err(e) = link.flush(self.transport.as_mut(), now) {
            log::warn!("link to server failed: {e}");
            self.lose_connection();
        }
    }

    /// Smoothed position of a remote entity, if it appeared in the last
    /// applied snapshot.
    pub fn remote_position(&self, entity: u32, now: Instant) -> Option<Vec3> {
        let now_ms = self.local_time_ms(now);
        self.remotes.get(&entity).map(|track| track.value_at(now_ms))
    }

    pub fn remote_velocity(&self, entity: u32, now: Instant) -> Option<Vec3> {
        let now_ms = self.local_time_ms(now);
        self.remotes.get(&entity).map(|track| track.velocity_at(now_ms))
    }

    pub fn remote_entities(&self) -> impl Iterator<Item = u32> + '_ {
        self.remotes.keys().copied()
    }

    pub fn ping(&self) -> u32 {
        self.link.as_ref().map_or(0, PeerConnection::ping)
    }

    pub fn prediction(&self) -> u32 {
        self.link
            .as_ref()
            .map_or(0, PeerConnection::prediction_offset)
    }

    pub fn time_since_last_packet(&self, now: Instant) -> u32 {
        self.link
            .as_ref()
            .map_or(0, |link| link.time_since_last_packet(now))
    }

    pub fn outgoing_rate(&self, now: Instant) -> u32 {
        self.link
            .as_ref()
            .map_or(0, |link| link.outgoing_rate(now))
    }

    pub fn incoming_rate(&self, now: Instant) -> u32 {
        self.link
            .as_ref()
            .map_or(0, |link| link.incoming_rate(now))
    }

    pub fn incoming_packet_loss(&self) -> f32 {
        self.link
            .as_ref()
            .map_or(0.0, PeerConnection::incoming_packet_loss)
    }
}
