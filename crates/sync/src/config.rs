use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_TICK_RATE: u32 = 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReliableConfig {
    pub fragment_size: usize,
    pub max_fragments: u16,
    pub max_outstanding_bytes: usize,
    /// How far past the last delivered sequence the receiver buffers.
    pub receive_window: u32,
    pub resend_min_ms: u64,
    pub resend_max_ms: u64,
    pub max_retries: u32,
}

impl Default for ReliableConfig {
    fn default() -> Self {
        Self {
            fragment_size: 1024,
            max_fragments: 64,
            max_outstanding_bytes: 256 * 1024,
            receive_window: 1024,
            resend_min_ms: 100,
            resend_max_ms: 2000,
            max_retries: 20,
        }
    }
}

impl ReliableConfig {
    pub fn resend_min(&self) -> Duration {
        Duration::from_millis(self.resend_min_ms)
    }

    pub fn resend_max(&self) -> Duration {
        Duration::from_millis(self.resend_max_ms.max(self.resend_min_ms))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    pub timeout_ms: u64,
    /// Outgoing budget in bytes per second; snapshots that would exceed it are skipped.
    pub max_outgoing_rate: u32,
    pub rate_window_ms: u64,
    pub loss_window: usize,
    pub keepalive_ms: u64,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            max_outgoing_rate: 64_000,
            rate_window_ms: 1000,
            loss_window: 64,
            keepalive_ms: 250,
        }
    }
}

impl PeerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn rate_window(&self) -> Duration {
        Duration::from_millis(self.rate_window_ms.max(1))
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_millis(self.keepalive_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub tick_rate: u32,
    pub max_clients: usize,
    /// Snapshots go out every `snapshot_interval` ticks.
    pub snapshot_interval: u32,
    pub snapshot_history: usize,
    /// A peer whose acknowledged base is older than this gets a full snapshot.
    pub max_delta_age: u32,
    pub peer: PeerConfig,
    pub reliable: ReliableConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            tick_rate: DEFAULT_TICK_RATE,
            max_clients: 32,
            snapshot_interval: 1,
            snapshot_history: 64,
            max_delta_age: 32,
            peer: PeerConfig::default(),
            reliable: ReliableConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub tick_rate: u32,
    pub handshake_resend_ms: u64,
    pub max_pending_inputs: usize,
    pub snapshot_history: usize,
    pub extrapolation_limit_ms: f32,
    pub correction_blend_ms: f32,
    pub peer: PeerConfig,
    pub reliable: ReliableConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            tick_rate: DEFAULT_TICK_RATE,
            handshake_resend_ms: 250,
            max_pending_inputs: 128,
            snapshot_history: 32,
            extrapolation_limit_ms: 250.0,
            correction_blend_ms: 100.0,
            peer: PeerConfig::default(),
            reliable: ReliableConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn handshake_resend(&self) -> Duration {
        Duration::from_millis(self.handshake_resend_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resend_bounds_are_ordered() {
        let config = ReliableConfig {
            resend_min_ms: 500,
            resend_max_ms: 100,
            ..Default::default()
        };
        assert!(config.resend_max() >= config.resend_min());
    }

    #[test]
    fn delta_age_fits_in_history() {
        let config = ServerConfig::default();
        assert!((config.max_delta_age as usize) < config.snapshot_history);
    }
}
