mod input;
mod tick;

pub use input::{BufferedInput, InputBuffer};
pub use tick::{FixedTimestep, MAX_FRAME_DELTA};
