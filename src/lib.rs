//! soundboard-rs - hotkey-driven soundboard and sampler
//!
//! Records input and loopback devices to WAV, plays sounds into a virtual
//! microphone with local monitoring, and routes the live microphone through a
//! reverb and pitch chain, all driven by keyboard or MIDI hotkeys.

pub mod audio;
pub mod device;
pub mod effects;
pub mod engine;
pub mod error;
pub mod midi;
pub mod settings;
