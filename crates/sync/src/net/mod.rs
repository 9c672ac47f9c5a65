mod connection;
mod protocol;
mod reliable;
mod simulator;
mod stats;
mod tracking;
mod transport;

pub use connection::{PeerConnection, PeerState, PeerTable};
pub use protocol::{
    DEFAULT_PORT, FRAGMENT_OVERHEAD, InputFrame, MAX_FRAGMENT_PAYLOAD, MAX_PACKET_SIZE,
    MAX_SNAPSHOT_PARTS, PACKET_OVERHEAD, PROTOCOL_MAGIC, PROTOCOL_VERSION, Packet, PacketError,
    PacketHeader, PacketType, ReliableFragment, SnapshotFrame, sequence_greater_than,
};
pub use reliable::ReliableChannel;
pub use simulator::{ConditionedTransport, LinkConditions, MemoryNetwork, MemoryTransport, SimulatorStats};
pub use stats::{LossWindow, NetworkStats, RateMeter};
pub use tracking::{AckTracker, Arrival, PendingPacket, ReceiveTracker};
pub use transport::{ThreadedUdpTransport, Transport, UdpTransport};
