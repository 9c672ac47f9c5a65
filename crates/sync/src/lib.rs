pub mod config;
pub mod error;
pub mod extrapolate;
pub mod net;
pub mod simulation;
pub mod snapshot;
pub mod sync;

pub use config::{ClientConfig, DEFAULT_TICK_RATE, PeerConfig, ReliableConfig, ServerConfig};
pub use error::{Result, SyncError};
pub use extrapolate::{
    AccelDecel, EaseCurve, Extrapolatable, Extrapolation, ExtrapolationFlags, ExtrapolationKind,
    Extrapolator, Interpolator,
};
pub use net::{
    ConditionedTransport, DEFAULT_PORT, LinkConditions, MemoryNetwork, MemoryTransport,
    NetworkStats, Packet, PacketError, PacketHeader, PacketType, PeerConnection, PeerState,
    ReliableChannel, ThreadedUdpTransport, Transport, UdpTransport,
};
pub use simulation::{FixedTimestep, InputBuffer};
pub use snapshot::{FieldKey, Snapshot, SnapshotAssembler, SnapshotHistory, StateMap};
pub use sync::{
    ClientEvent, ClientState, DisconnectReason, Game, LOCAL_CLIENT_NUM, NetworkSystem,
    PredictionCoordinator, RemoteMotion, ServerEvent, SyncCoordinator,
};
