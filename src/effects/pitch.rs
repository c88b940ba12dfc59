//! Pitch stage: delay-line pitch shifter with optional autotune
//!
//! Two read taps sweep a short delay line half a window apart and are
//! crossfaded with complementary sin² gains, so the frame count is preserved
//! and the shifter adds a fixed latency of at most one window.
//!
//! In autotune mode a [`PitchDetector`] estimates the input's fundamental and
//! the shift glides toward the nearest equal-tempered note.

use std::f32::consts::PI;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use super::{PitchMode, PitchSettings};

/// Delay window of the shifter
const WINDOW_SECS: f32 = 0.05;

/// Detectable fundamental range
const MIN_FREQUENCY: f32 = 80.0;
const MAX_FREQUENCY: f32 = 1000.0;

/// Cumulative-mean-normalized difference threshold
const YIN_THRESHOLD: f32 = 0.15;

/// Frames below this mean energy are treated as unpitched
const SILENCE_ENERGY: f32 = 1.0e-6;

/// Convert a frequency to a fractional MIDI note number
pub fn frequency_to_note(frequency: f32) -> f32 {
    69.0 + 12.0 * (frequency / 440.0).log2()
}

/// Autocorrelation (YIN) fundamental frequency estimator.
///
/// All buffers are sized at construction. The latest estimate is also
/// published through an atomic so the control thread can read it.
pub struct PitchDetector {
    sample_rate: f32,
    ring: Vec<f32>,
    write: usize,
    filled: usize,
    since_last: usize,
    hop: usize,
    frame: Vec<f32>,
    cmnd: Vec<f32>,
    min_lag: usize,
    max_lag: usize,
    last: Option<f32>,
    published: Arc<AtomicU32>,
}

impl PitchDetector {
    pub fn new(sample_rate: u32) -> Self {
        let sr = sample_rate.max(1) as f32;
        let min_lag = ((sr / MAX_FREQUENCY) as usize).max(2);
        let max_lag = ((sr / MIN_FREQUENCY) as usize).max(min_lag + 1);
        let size = max_lag * 2;
        Self {
            sample_rate: sr,
            ring: vec![0.0; size],
            write: 0,
            filled: 0,
            since_last: 0,
            hop: size / 2,
            frame: vec![0.0; size],
            cmnd: vec![0.0; max_lag + 1],
            min_lag,
            max_lag,
            last: None,
            published: Arc::new(AtomicU32::new(0.0_f32.to_bits())),
        }
    }

    /// Handle the control thread reads the latest estimate from (0.0 = none)
    pub fn published(&self) -> Arc<AtomicU32> {
        Arc::clone(&self.published)
    }

    pub fn last(&self) -> Option<f32> {
        self.last
    }

    /// Push one mono sample. Returns a fresh estimate when a hop completed.
    #[inline]
    pub fn push(&mut self, sample: f32) -> Option<Option<f32>> {
        self.ring[self.write] = sample;
        self.write = (self.write + 1) % self.ring.len();
        self.filled = (self.filled + 1).min(self.ring.len());
        self.since_last += 1;

        if self.filled == self.ring.len() && self.since_last >= self.hop {
            self.since_last = 0;
            let estimate = self.analyze();
            self.last = estimate;
            self.published
                .store(estimate.unwrap_or(0.0).to_bits(), Ordering::Relaxed);
            Some(estimate)
        } else {
            None
        }
    }

    fn analyze(&mut self) -> Option<f32> {
        let size = self.ring.len();
        for i in 0..size {
            self.frame[i] = self.ring[(self.write + i) % size];
        }

        let energy = self.frame.iter().map(|s| s * s).sum::<f32>() / size as f32;
        if energy < SILENCE_ENERGY {
            return None;
        }

        let width = size - self.max_lag;
        let mut running = 0.0f32;
        self.cmnd[0] = 1.0;
        for tau in 1..=self.max_lag {
            let mut diff = 0.0f32;
            for j in 0..width {
                let d = self.frame[j] - self.frame[j + tau];
                diff += d * d;
            }
            running += diff;
            self.cmnd[tau] = if running > 0.0 {
                diff * tau as f32 / running
            } else {
                1.0
            };
        }

        let mut tau = self.min_lag;
        while tau <= self.max_lag {
            if self.cmnd[tau] < YIN_THRESHOLD {
                while tau < self.max_lag && self.cmnd[tau + 1] < self.cmnd[tau] {
                    tau += 1;
                }
                return Some(self.sample_rate / self.refine(tau));
            }
            tau += 1;
        }
        None
    }

    /// Parabolic interpolation around a local minimum
    fn refine(&self, tau: usize) -> f32 {
        if tau == 0 || tau >= self.max_lag {
            return tau as f32;
        }
        let (a, b, c) = (self.cmnd[tau - 1], self.cmnd[tau], self.cmnd[tau + 1]);
        let denom = a - 2.0 * b + c;
        if denom.abs() < f32::EPSILON {
            tau as f32
        } else {
            tau as f32 + 0.5 * (a - c) / denom
        }
    }
}

/// Frame-count preserving pitch shifter
pub struct PitchShifter {
    channels: usize,
    window: usize,
    lines: Vec<Vec<f32>>,
    write_pos: usize,
    delay: f32,
    ratio: f32,
    mode: PitchMode,
    correction: f32,
    detector: PitchDetector,
}

impl PitchShifter {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        let channels = channels.max(1) as usize;
        let window = ((sample_rate as f32 * WINDOW_SECS) as usize).max(4);
        Self {
            channels,
            window,
            lines: vec![vec![0.0; window + 2]; channels],
            write_pos: 0,
            delay: 0.0,
            ratio: 1.0,
            mode: PitchSettings::default().mode,
            correction: 0.0,
            detector: PitchDetector::new(sample_rate),
        }
    }

    pub fn set(&mut self, settings: &PitchSettings) {
        match settings.mode {
            PitchMode::Shift { semitones } => self.ratio = semitones_to_ratio(semitones),
            // Entering autotune starts from unshifted until a note is detected
            PitchMode::Autotune { .. } if !matches!(self.mode, PitchMode::Autotune { .. }) => {
                self.ratio = 1.0;
                self.correction = 0.0;
            }
            PitchMode::Autotune { .. } => {}
        }
        self.mode = settings.mode;
    }

    pub fn ratio(&self) -> f32 {
        self.ratio
    }

    /// Current autotune correction in semitones
    pub fn correction(&self) -> f32 {
        self.correction
    }

    pub fn detected_frequency(&self) -> Option<f32> {
        self.detector.last()
    }

    /// Atomic the control thread can poll for the latest detected pitch
    pub fn published_frequency(&self) -> Arc<AtomicU32> {
        self.detector.published()
    }

    #[inline]
    fn read(&self, channel: usize, delay: f32) -> f32 {
        let line = &self.lines[channel];
        let len = line.len() as f32;
        let mut pos = self.write_pos as f32 - delay;
        if pos < 0.0 {
            pos += len;
        }
        let i0 = pos as usize % line.len();
        let i1 = (i0 + 1) % line.len();
        let frac = pos - pos.floor();
        line[i0] * (1.0 - frac) + line[i1] * frac
    }

    /// Process an interleaved buffer in place
    pub fn process(&mut self, buffer: &mut [f32]) {
        let window = self.window as f32;
        let half = window / 2.0;
        let channels = self.channels;

        for f in 0..buffer.len() / channels {
            let frame = &mut buffer[f * channels..(f + 1) * channels];

            if let PitchMode::Autotune { speed } = self.mode {
                let mono = frame.iter().sum::<f32>() / channels as f32;
                if let Some(Some(frequency)) = self.detector.push(mono) {
                    let note = frequency_to_note(frequency);
                    let target = note.round() - note;
                    self.correction += (target - self.correction) * speed.clamp(0.01, 1.0);
                    self.ratio = semitones_to_ratio(self.correction);
                }
            }

            for (ch, sample) in frame.iter().enumerate() {
                self.lines[ch][self.write_pos] = *sample;
            }

            let d1 = self.delay;
            let mut d2 = d1 + half;
            if d2 >= window {
                d2 -= window;
            }
            let g1 = (PI * d1 / window).sin().powi(2);
            let g2 = 1.0 - g1;

            for ch in 0..channels {
                frame[ch] = g1 * self.read(ch, d1) + g2 * self.read(ch, d2);
            }

            self.delay += 1.0 - self.ratio;
            while self.delay >= window {
                self.delay -= window;
            }
            while self.delay < 0.0 {
                self.delay += window;
            }
            self.write_pos = (self.write_pos + 1) % self.lines[0].len();
        }
    }

    pub fn reset(&mut self) {
        for line in &mut self.lines {
            line.fill(0.0);
        }
        self.write_pos = 0;
        self.delay = 0.0;
        self.correction = 0.0;
        if matches!(self.mode, PitchMode::Autotune { .. }) {
            self.ratio = 1.0;
        }
    }
}

pub fn semitones_to_ratio(semitones: f32) -> f32 {
    2.0f32.powf(semitones / 12.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(frequency: f32, sample_rate: u32, frames: usize) -> Vec<f32> {
        (0..frames)
            .map(|i| (2.0 * PI * frequency * i as f32 / sample_rate as f32).sin() * 0.5)
            .collect()
    }

    #[test]
    fn test_detector_finds_sine_fundamental() {
        let mut detector = PitchDetector::new(48000);
        let mut estimate = None;
        for sample in sine(220.0, 48000, 48000 / 4) {
            if let Some(e) = detector.push(sample) {
                estimate = e;
            }
        }
        let frequency = estimate.expect("pitched input");
        assert!((frequency - 220.0).abs() < 220.0 * 0.02, "got {}", frequency);

        let published = f32::from_bits(detector.published().load(Ordering::Relaxed));
        assert_eq!(published, frequency);
    }

    #[test]
    fn test_detector_ignores_silence() {
        let mut detector = PitchDetector::new(48000);
        let mut estimates = Vec::new();
        for _ in 0..48000 / 4 {
            if let Some(e) = detector.push(0.0) {
                estimates.push(e);
            }
        }
        assert!(!estimates.is_empty());
        assert!(estimates.iter().all(Option::is_none));
    }

    #[test]
    fn test_shift_preserves_frame_count() {
        let mut shifter = PitchShifter::new(48000, 2);
        shifter.set(&PitchSettings {
            enabled: true,
            mode: PitchMode::Shift { semitones: 7.0 },
        });
        let mut buffer = vec![0.25f32; 512];
        shifter.process(&mut buffer);
        assert_eq!(buffer.len(), 512);
        assert!((shifter.ratio() - semitones_to_ratio(7.0)).abs() < 1e-6);
    }

    #[test]
    fn test_autotune_pulls_toward_nearest_note() {
        let mut shifter = PitchShifter::new(48000, 1);
        shifter.set(&PitchSettings {
            enabled: true,
            mode: PitchMode::Autotune { speed: 1.0 },
        });

        // 226 Hz sits ~0.47 semitones above A3 (220 Hz)
        let mut input = sine(226.0, 48000, 48000 / 2);
        for chunk in input.chunks_mut(256) {
            shifter.process(chunk);
        }

        assert!(shifter.correction() < -0.3, "correction {}", shifter.correction());
        assert!(shifter.ratio() < 1.0);
        let detected = shifter.detected_frequency().expect("voiced input");
        assert!((detected - 226.0).abs() < 226.0 * 0.02, "detected {}", detected);
    }

    #[test]
    fn test_switching_to_autotune_drops_fixed_shift() {
        let mut shifter = PitchShifter::new(48000, 1);
        shifter.set(&PitchSettings {
            enabled: true,
            mode: PitchMode::Shift { semitones: 12.0 },
        });
        assert!((shifter.ratio() - 2.0).abs() < 1e-6);

        shifter.set(&PitchSettings {
            enabled: true,
            mode: PitchMode::Autotune { speed: 0.5 },
        });
        let mut silence = vec![0.0f32; 256];
        shifter.process(&mut silence);

        assert_eq!(shifter.ratio(), 1.0);
        assert_eq!(shifter.correction(), 0.0);
    }
}
