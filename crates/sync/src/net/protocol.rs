use rkyv::util::AlignedVec;
use rkyv::{Archive, Deserialize, Serialize, rancor};

use crate::snapshot::Snapshot;

pub const MAX_PACKET_SIZE: usize = 1200;
pub const PROTOCOL_VERSION: u32 = 1;
pub const PROTOCOL_MAGIC: u32 = 0x5445_5448;
pub const DEFAULT_PORT: u16 = 27015;

/// Upper bound for the header, enum tag and vector framing of a packet.
pub const PACKET_OVERHEAD: usize = 64;
/// Upper bound for the framing of one reliable fragment inside a packet.
pub const FRAGMENT_OVERHEAD: usize = 24;
pub const MAX_FRAGMENT_PAYLOAD: usize = MAX_PACKET_SIZE - PACKET_OVERHEAD - FRAGMENT_OVERHEAD;
/// Snapshots that do not fit one datagram are split into at most this many parts.
pub const MAX_SNAPSHOT_PARTS: u16 = 64;

const SEQUENCE_WRAP_THRESHOLD: u32 = u32::MAX / 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(compare(PartialEq), derive(Debug))]
pub struct PacketHeader {
    pub magic: u32,
    pub version: u32,
    pub sequence: u32,
    pub ack: u32,
    pub ack_bitfield: u32,
    /// Highest contiguously received reliable sequence, 0 when none.
    pub reliable_ack: u32,
}

impl PacketHeader {
    pub fn new(sequence: u32, ack: u32, ack_bitfield: u32, reliable_ack: u32) -> Self {
        Self {
            magic: PROTOCOL_MAGIC,
            version: PROTOCOL_VERSION,
            sequence,
            ack,
            ack_bitfield,
            reliable_ack,
        }
    }

    /// Header for packets sent outside an established link (handshake replies, denials).
    pub fn unsequenced() -> Self {
        Self::new(0, 0, 0, 0)
    }

    pub fn is_valid(&self) -> bool {
        self.magic == PROTOCOL_MAGIC && self.version == PROTOCOL_VERSION
    }
}

#[inline]
pub fn sequence_greater_than(s1: u32, s2: u32) -> bool {
    ((s1 > s2) && (s1 - s2 <= SEQUENCE_WRAP_THRESHOLD))
        || ((s1 < s2) && (s2 - s1 > SEQUENCE_WRAP_THRESHOLD))
}

#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct ReliableFragment {
    pub sequence: u32,
    pub fragment_index: u16,
    pub fragment_count: u16,
    pub data: Vec<u8>,
}

impl ReliableFragment {
    pub fn wire_size(&self) -> usize {
        self.data.len() + FRAGMENT_OVERHEAD
    }
}

#[derive(Debug, Clone, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct SnapshotFrame {
    /// One slice of the snapshot's entries; every part repeats its header.
    pub snapshot: Snapshot,
    /// Newest input sequence the server has consumed from this client.
    pub input_ack: Option<u32>,
    pub part_index: u16,
    pub part_count: u16,
}

impl SnapshotFrame {
    pub fn whole(snapshot: Snapshot, input_ack: Option<u32>) -> Self {
        Self {
            snapshot,
            input_ack,
            part_index: 0,
            part_count: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct InputFrame {
    pub sequence: u32,
    /// How far, in milliseconds, the client runs ahead of its acknowledged state.
    pub prediction_ms: u32,
    pub acked_snapshot: Option<u32>,
    /// Set while the client has dropped its snapshot history and needs a full one.
    pub request_full: bool,
    pub payload: Vec<u8>,
}

/// Channel tag of a datagram.
#[derive(Debug, Clone, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub enum PacketType {
    ConnectionRequest {
        client_salt: u64,
    },
    ConnectionChallenge {
        server_salt: u64,
        challenge: u64,
    },
    ChallengeResponse {
        combined_salt: u64,
    },
    ConnectionAccepted {
        client_num: u32,
    },
    ConnectionDenied {
        reason: String,
    },
    Disconnect,
    Reliable(Vec<ReliableFragment>),
    Ack,
    Snapshot(SnapshotFrame),
    Input(InputFrame),
}

#[derive(Debug, Clone, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct Packet {
    pub header: PacketHeader,
    pub payload: PacketType,
}

#[derive(Debug, thiserror::Error)]
pub enum PacketError {
    #[error("serialization failed: {0}")]
    Serialize(rancor::Error),
    #[error("deserialization failed: {0}")]
    Deserialize(rancor::Error),
    #[error("packet of {size} bytes exceeds the {limit} byte limit")]
    Oversized { size: usize, limit: usize },
    #[error("bad protocol magic or version")]
    BadHeader,
}

impl Packet {
    pub fn new(header: PacketHeader, payload: PacketType) -> Self {
        Self { header, payload }
    }

    pub fn serialize(&self) -> Result<Vec<u8>, PacketError> {
        let bytes = rkyv::to_bytes::<rancor::Error>(self)
            .map(|aligned| aligned.into_vec())
            .map_err(PacketError::Serialize)?;
        if bytes.len() > MAX_PACKET_SIZE {
            return Err(PacketError::Oversized {
                size: bytes.len(),
                limit: MAX_PACKET_SIZE,
            });
        }
        Ok(bytes)
    }

    /// Datagrams arrive at arbitrary alignment, so they are copied before validation.
    pub fn deserialize(data: &[u8]) -> Result<Self, PacketError> {
        if data.len() > MAX_PACKET_SIZE {
            return Err(PacketError::Oversized {
                size: data.len(),
                limit: MAX_PACKET_SIZE,
            });
        }
        let mut aligned = AlignedVec::<16>::with_capacity(data.len());
        aligned.extend_from_slice(data);
        let packet = rkyv::from_bytes::<Self, rancor::Error>(&aligned)
            .map_err(PacketError::Deserialize)?;
        if !packet.header.is_valid() {
            return Err(PacketError::BadHeader);
        }
        Ok(packet)
    }
}
