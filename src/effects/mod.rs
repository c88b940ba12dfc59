//! Effects chain for the passthrough voice path
//!
//! Pitch stage followed by reverb stage, each independently enabled. All
//! working buffers are sized in [`EffectsChain::new`]; `process` never
//! allocates.

mod pitch;
mod reverb;

use std::sync::atomic::AtomicU32;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub use pitch::{frequency_to_note, semitones_to_ratio, PitchDetector, PitchShifter};
pub use reverb::Reverb;

/// Reverb parameters, all in `0.0..=1.0`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReverbSettings {
    pub enabled: bool,
    pub room_size: f32,
    pub damp: f32,
    pub width: f32,
    pub wet_mix: f32,
    pub dry_mix: f32,
}

impl Default for ReverbSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            room_size: 0.5,
            damp: 0.5,
            width: 1.0,
            wet_mix: 0.33,
            dry_mix: 0.7,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PitchMode {
    /// Fixed shift in semitones
    Shift { semitones: f32 },
    /// Glide toward the nearest note; `speed` 1.0 snaps immediately
    Autotune { speed: f32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PitchSettings {
    pub enabled: bool,
    pub mode: PitchMode,
}

impl Default for PitchSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            mode: PitchMode::Autotune { speed: 0.5 },
        }
    }
}

/// Snapshot of every stage's parameters.
///
/// `Copy` so it can be handed to the real-time path through a lock-free queue.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EffectSettings {
    pub reverb: ReverbSettings,
    pub pitch: PitchSettings,
}

impl EffectSettings {
    /// Every stage disabled
    pub fn bypass() -> Self {
        Self::default()
    }

    pub fn is_bypass(&self) -> bool {
        !self.reverb.enabled && !self.pitch.enabled
    }
}

pub struct EffectsChain {
    channels: usize,
    max_frames: usize,
    settings: EffectSettings,
    pitch: PitchShifter,
    reverb: Reverb,
}

impl EffectsChain {
    /// `max_frames` bounds the buffer size `process` accepts
    pub fn new(sample_rate: u32, channels: u16, max_frames: usize) -> Self {
        let mut chain = Self {
            channels: channels.max(1) as usize,
            max_frames,
            settings: EffectSettings::bypass(),
            pitch: PitchShifter::new(sample_rate, channels),
            reverb: Reverb::new(sample_rate),
        };
        chain.apply(EffectSettings::bypass());
        chain
    }

    /// Install new parameters; they take effect from the next processed frame.
    /// A stage that gets re-enabled starts from a clean state.
    pub fn apply(&mut self, settings: EffectSettings) {
        if settings.reverb.enabled && !self.settings.reverb.enabled {
            self.reverb.reset();
        }
        if settings.pitch.enabled && !self.settings.pitch.enabled {
            self.pitch.reset();
        }
        self.reverb.set(&settings.reverb);
        self.pitch.set(&settings.pitch);
        self.settings = settings;
    }

    /// Run one buffer of interleaved frames through the enabled stages.
    ///
    /// Returns false when the buffer shape was unusable; `output` is then
    /// silence.
    pub fn process(&mut self, input: &[f32], output: &mut [f32]) -> bool {
        let well_formed = input.len() == output.len()
            && input.len() % self.channels == 0
            && input.len() / self.channels <= self.max_frames;
        if !well_formed {
            output.fill(0.0);
            return false;
        }

        output.copy_from_slice(input);
        if self.settings.pitch.enabled {
            self.pitch.process(output);
        }
        if self.settings.reverb.enabled {
            self.reverb.process(output, self.channels);
        }
        true
    }

    /// Latest autotune pitch estimate as `f32` bits; 0.0 when none
    pub fn published_frequency(&self) -> Arc<AtomicU32> {
        self.pitch.published_frequency()
    }
}
