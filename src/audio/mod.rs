//! Audio module - stream kinds and the driver layer they run on
//!
//! This module provides:
//! - Driver binding layer (cpal and a simulated clock for tests)
//! - Capture to WAV (input and loopback recorders)
//! - WAV playback (Player and Monitor)
//! - Live passthrough through the effects chain

mod capture;
mod cpal_driver;
mod driver;
mod passthrough;
mod playback;
mod simulated;
mod status;

pub use capture::{CaptureOptions, CaptureStream, Recording};
pub use cpal_driver::CpalDriver;
pub use driver::{
    AudioCallback, AudioDriver, CallbackFlow, CallbackInfo, DriverBinding, StreamConfig,
};
pub use passthrough::PassthroughStream;
pub use playback::{PlaybackRole, PlaybackStream};
pub use simulated::SimulatedDriver;
pub use status::{Faults, StreamState, StreamStatus};
