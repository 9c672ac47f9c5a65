use glam::Vec3;

use crate::snapshot::StateMap;

/// Client number the listen-server's own client is known by.
pub const LOCAL_CLIENT_NUM: u32 = 0;

/// Position and velocity (units per second) of an entity the client smooths
/// rather than predicts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RemoteMotion {
    pub entity: u32,
    pub position: Vec3,
    pub velocity: Vec3,
}

/// The simulation the network layer keeps in sync. Payloads and state values
/// are opaque here.
///
/// On the client, `client_num` is the local client's own number.
pub trait Game {
    fn collect_state(&mut self) -> StateMap;

    fn apply_state(&mut self, state: &StateMap);

    fn consume_reliable(&mut self, client_num: u32, payload: &[u8]);

    fn consume_input(&mut self, client_num: u32, payload: &[u8]);

    fn remote_motion(&self, _state: &StateMap) -> Vec<RemoteMotion> {
        Vec::new()
    }
}
