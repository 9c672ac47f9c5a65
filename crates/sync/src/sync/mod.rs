mod client;
mod events;
mod game;
mod remote;
mod server;
mod system;

pub use client::{ClientState, PredictionCoordinator};
pub use events::{ClientEvent, DisconnectReason, ServerEvent};
pub use game::{Game, LOCAL_CLIENT_NUM, RemoteMotion};
pub use remote::RemoteTrack;
pub use server::SyncCoordinator;
pub use system::NetworkSystem;
