use std::io;

use crate::net::PacketError;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("reliable channel overflow: {outstanding} bytes outstanding, limit {limit}")]
    ChannelOverflow { outstanding: usize, limit: usize },
    #[error("link to client {client_num} timed out")]
    LinkTimeout { client_num: u32 },
    #[error("reliable sequence {received} is beyond the receive window (expected {expected})")]
    SequenceGapUnresolvable { expected: u32, received: u32 },
    #[error("malformed message: {0}")]
    MalformedMessage(String),
    #[error("packet error: {0}")]
    Packet(#[from] PacketError),
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),
    #[error("unknown peer {0}")]
    UnknownPeer(u32),
    #[error("peer {0} is not active")]
    PeerNotActive(u32),
    #[error("server full")]
    ServerFull,
}

impl SyncError {
    /// Conditions that terminate the link rather than a single message.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::LinkTimeout { .. } | Self::ChannelOverflow { .. })
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
