mod assembly;
mod history;
mod state;

pub use assembly::SnapshotAssembler;
pub use history::{HistoryEntry, SnapshotHistory};
pub use state::{FieldKey, Snapshot, SnapshotEntry, StateMap};
