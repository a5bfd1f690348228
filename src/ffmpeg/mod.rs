pub mod transcoder;
pub mod wrapper;

pub use transcoder::{AudioSettings, Failure, Outcome};
pub use wrapper::FFMpegWrapper;
