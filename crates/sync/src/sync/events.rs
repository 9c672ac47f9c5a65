use std::fmt;
use std::net::SocketAddr;

#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    PeerConnecting {
        client_num: u32,
        addr: SocketAddr,
    },
    PeerConnected {
        client_num: u32,
        addr: SocketAddr,
    },
    PeerDisconnected {
        client_num: u32,
        reason: DisconnectReason,
    },
    ConnectionDenied {
        addr: SocketAddr,
        reason: String,
    },
    /// The peer fell out of sync and will receive a full snapshot.
    PeerResync {
        client_num: u32,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Connected { client_num: u32 },
    Denied { reason: String },
    /// The reliable stream desynced; snapshots restart from a full one.
    Resync,
    ConnectionLost,
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    Graceful,
    Timeout,
    Kicked,
    Overflow,
}

impl DisconnectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisconnectReason::Graceful => "disconnected",
            DisconnectReason::Timeout => "timed out",
            DisconnectReason::Kicked => "kicked",
            DisconnectReason::Overflow => "reliable overflow",
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
