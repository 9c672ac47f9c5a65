use std::collections::BTreeMap;

use glam::Vec3;
use rkyv::util::AlignedVec;
use rkyv::{Archive, Deserialize, Serialize, rancor};

use tether::{FieldKey, Game, RemoteMotion, ServerEvent, StateMap};

const POSITION: u16 = 0;
const VELOCITY: u16 = 1;
const WALK_SPEED: f32 = 5.0;
const SPRINT_SPEED: f32 = 10.0;

/// Movement command sent by arena clients every tick.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
#[rkyv(derive(Debug))]
pub struct MoveInput {
    pub direction: [f32; 3],
    pub sprint: bool,
}

impl MoveInput {
    pub fn encode(&self) -> Result<Vec<u8>, rancor::Error> {
        rkyv::to_bytes::<rancor::Error>(self).map(|bytes| bytes.into_vec())
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, rancor::Error> {
        let mut aligned = AlignedVec::<16>::with_capacity(bytes.len());
        aligned.extend_from_slice(bytes);
        rkyv::from_bytes::<Self, rancor::Error>(&aligned)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct Player {
    position: Vec3,
    velocity: Vec3,
}

/// Players gliding around an open plane; just enough state to exercise sync.
#[derive(Debug, Default)]
pub struct Arena {
    players: BTreeMap<u32, Player>,
    dt: f32,
    chat: Vec<(u32, String)>,
}

fn encode_vec3(v: Vec3) -> Vec<u8> {
    v.to_array().iter().flat_map(|c| c.to_le_bytes()).collect()
}

fn decode_vec3(bytes: &[u8]) -> Option<Vec3> {
    let mut components = bytes
        .chunks_exact(4)
        .map(|chunk| <[u8; 4]>::try_from(chunk).map(f32::from_le_bytes));
    let x = components.next()?.ok()?;
    let y = components.next()?.ok()?;
    let z = components.next()?.ok()?;
    Some(Vec3::new(x, y, z))
}

impl Arena {
    pub fn new(tick_rate: u32) -> Self {
        Self {
            dt: 1.0 / tick_rate.max(1) as f32,
            ..Default::default()
        }
    }

    pub fn spawn(&mut self, client_num: u32) {
        self.players.entry(client_num).or_default();
    }

    pub fn despawn(&mut self, client_num: u32) {
        self.players.remove(&client_num);
    }

    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    pub fn chat(&self) -> &[(u32, String)] {
        &self.chat
    }

    pub fn handle_event(&mut self, event: &ServerEvent) {
        match event {
            ServerEvent::PeerConnected { client_num, .. } => self.spawn(*client_num),
            ServerEvent::PeerDisconnected { client_num, .. } => self.despawn(*client_num),
            _ => {}
        }
    }
}

impl Game for Arena {
    fn collect_state(&mut self) -> StateMap {
        let mut state = StateMap::new();
        for (client_num, player) in &self.players {
            state.insert(FieldKey::new(*client_num, POSITION), encode_vec3(player.position));
            state.insert(FieldKey::new(*client_num, VELOCITY), encode_vec3(player.velocity));
        }
        state
    }

    fn apply_state(&mut self, state: &StateMap) {
        self.players.clear();
        for (key, value) in state {
            let Some(v) = decode_vec3(value) else {
                continue;
            };
            let player = self.players.entry(key.entity).or_default();
            match key.field {
                POSITION => player.position = v,
                VELOCITY => player.velocity = v,
                _ => {}
            }
        }
    }

    fn consume_reliable(&mut self, client_num: u32, payload: &[u8]) {
        let text = String::from_utf8_lossy(payload).into_owned();
        log::info!("[chat] client {client_num}: {text}");
        self.chat.push((client_num, text));
    }

    fn consume_input(&mut self, client_num: u32, payload: &[u8]) {
        let input = match MoveInput::decode(payload) {
            Ok(input) => input,
            Err(e) => {
                log::debug!("ignoring bad input from client {client_num}: {e}");
                return;
            }
        };

        let speed = if input.sprint { SPRINT_SPEED } else { WALK_SPEED };
        let player = self.players.entry(client_num).or_default();
        player.velocity = Vec3::from_array(input.direction).normalize_or_zero() * speed;
        player.position += player.velocity * self.dt;
    }

    fn remote_motion(&self, state: &StateMap) -> Vec<RemoteMotion> {
        let mut motions: BTreeMap<u32, RemoteMotion> = BTreeMap::new();
        for (key, value) in state {
            let Some(v) = decode_vec3(value) else {
                continue;
            };
            let motion = motions.entry(key.entity).or_insert(RemoteMotion {
                entity: key.entity,
                position: Vec3::ZERO,
                velocity: Vec3::ZERO,
            });
            match key.field {
                POSITION => motion.position = v,
                VELOCITY => motion.velocity = v,
                _ => {}
            }
        }
        motions.into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(direction: [f32; 3], sprint: bool) -> Vec<u8> {
        MoveInput { direction, sprint }.encode().unwrap()
    }

    #[test]
    fn inputs_move_players() {
        let mut arena = Arena::new(10);
        arena.consume_input(3, &input([2.0, 0.0, 0.0], false));

        let state = arena.collect_state();
        let position = decode_vec3(&state[&FieldKey::new(3, POSITION)]).unwrap();
        let velocity = decode_vec3(&state[&FieldKey::new(3, VELOCITY)]).unwrap();
        assert_eq!(velocity, Vec3::new(WALK_SPEED, 0.0, 0.0));
        assert!((position.x - 0.5).abs() < 1e-6);

        arena.consume_input(3, &input([0.0, 0.0, 1.0], true));
        let state = arena.collect_state();
        let position = decode_vec3(&state[&FieldKey::new(3, POSITION)]).unwrap();
        assert!((position.z - 1.0).abs() < 1e-5);
        assert!((position.x - 0.5).abs() < 1e-6);
    }

    #[test]
    fn garbage_input_is_ignored() {
        let mut arena = Arena::new(60);
        arena.consume_input(1, &[0xFF, 0x00, 0x13]);
        assert_eq!(arena.player_count(), 0);
    }

    #[test]
    fn state_survives_the_game_boundary() {
        let mut server = Arena::new(60);
        server.consume_input(1, &input([1.0, 0.0, 0.0], false));
        server.spawn(2);
        let state = server.collect_state();

        let mut client = Arena::new(60);
        client.apply_state(&state);
        assert_eq!(client.collect_state(), state);

        let motions = client.remote_motion(&state);
        assert_eq!(motions.len(), 2);
        assert_eq!(motions[0].velocity, Vec3::new(WALK_SPEED, 0.0, 0.0));
    }

    #[test]
    fn connection_events_spawn_and_despawn() {
        let mut arena = Arena::new(60);
        let addr = "127.0.0.1:5000".parse().unwrap();
        arena.handle_event(&ServerEvent::PeerConnected { client_num: 4, addr });
        assert_eq!(arena.player_count(), 1);
        arena.handle_event(&ServerEvent::PeerDisconnected {
            client_num: 4,
            reason: tether::DisconnectReason::Timeout,
        });
        assert_eq!(arena.player_count(), 0);
    }
}
