use std::time::Instant;

use crate::error::{Result, SyncError};

use super::client::PredictionCoordinator;
use super::game::LOCAL_CLIENT_NUM;
use super::server::SyncCoordinator;

/// Engine-facing view over an optional server role and an optional client role.
///
/// Every query degrades to zero when its role is absent or not connected.
pub struct NetworkSystem<'a> {
    server: Option<&'a mut SyncCoordinator>,
    client: Option<&'a mut PredictionCoordinator>,
}

impl<'a> NetworkSystem<'a> {
    pub fn new(
        server: Option<&'a mut SyncCoordinator>,
        client: Option<&'a mut PredictionCoordinator>,
    ) -> Self {
        Self { server, client }
    }

    pub fn offline() -> Self {
        Self::new(None, None)
    }

    pub fn server(&mut self) -> Option<&mut SyncCoordinator> {
        self.server.as_deref_mut()
    }

    pub fn client(&mut self) -> Option<&mut PredictionCoordinator> {
        self.client.as_deref_mut()
    }

    pub fn is_server(&self) -> bool {
        self.server.is_some()
    }

    pub fn is_client(&self) -> bool {
        self.client.as_ref().is_some_and(|client| client.is_active())
    }

    pub fn server_send_reliable(
        &mut self,
        client_num: u32,
        payload: &[u8],
        now: Instant,
    ) -> Result<()> {
        match self.server.as_deref_mut() {
            Some(server) => server.send_reliable(client_num, payload, now),
            None => Err(SyncError::UnknownPeer(client_num)),
        }
    }

    pub fn server_send_reliable_excluding(
        &mut self,
        excluded: u32,
        payload: &[u8],
        now: Instant,
    ) -> Result<()> {
        match self.server.as_deref_mut() {
            Some(server) => server.send_reliable_excluding(excluded, payload, now),
            None => Ok(()),
        }
    }

    pub fn server_client_ping(&self, client_num: u32) -> u32 {
        self.server
            .as_deref()
            .map_or(0, |server| server.client_ping(client_num))
    }

    pub fn server_client_prediction(&self, client_num: u32) -> u32 {
        self.server
            .as_deref()
            .map_or(0, |server| server.client_prediction(client_num))
    }

    pub fn server_client_time_since_last_packet(&self, client_num: u32, now: Instant) -> u32 {
        self.server
            .as_deref()
            .map_or(0, |server| server.client_time_since_last_packet(client_num, now))
    }

    pub fn server_client_time_since_last_input(&self, client_num: u32, now: Instant) -> u32 {
        self.server
            .as_deref()
            .map_or(0, |server| server.client_time_since_last_input(client_num, now))
    }

    pub fn server_client_outgoing_rate(&self, client_num: u32, now: Instant) -> u32 {
        self.server
            .as_deref()
            .map_or(0, |server| server.client_outgoing_rate(client_num, now))
    }

    pub fn server_client_incoming_rate(&self, client_num: u32, now: Instant) -> u32 {
        self.server
            .as_deref()
            .map_or(0, |server| server.client_incoming_rate(client_num, now))
    }

    pub fn server_client_incoming_packet_loss(&self, client_num: u32) -> f32 {
        self.server
            .as_deref()
            .map_or(0.0, |server| server.client_incoming_packet_loss(client_num))
    }

    /// Reliable send to the server. A client that shares the process with the
    /// server and has no network link hands the message straight to it.
    pub fn client_send_reliable(&mut self, payload: &[u8]) -> Result<()> {
        if let Some(client) = self.client.as_deref_mut().filter(|client| client.is_active()) {
            return client.send_reliable(payload).map(|_| ());
        }
        match self.server.as_deref_mut() {
            Some(server) if server.has_local_client() => server.local_client_send_reliable(payload),
            _ => Err(SyncError::PeerNotActive(LOCAL_CLIENT_NUM)),
        }
    }

    pub fn client_prediction(&self) -> u32 {
        self.client
            .as_deref()
            .map_or(0, PredictionCoordinator::prediction)
    }

    pub fn client_time_since_last_packet(&self, now: Instant) -> u32 {
        self.client
            .as_deref()
            .map_or(0, |client| client.time_since_last_packet(now))
    }

    pub fn client_outgoing_rate(&self, now: Instant) -> u32 {
        self.client
            .as_deref()
            .map_or(0, |client| client.outgoing_rate(now))
    }

    pub fn client_incoming_rate(&self, now: Instant) -> u32 {
        self.client
            .as_deref()
            .map_or(0, |client| client.incoming_rate(now))
    }

    pub fn client_incoming_packet_loss(&self) -> f32 {
        self.client
            .as_deref()
            .map_or(0.0, PredictionCoordinator::incoming_packet_loss)
    }
}
