//! Freeverb-style reverb
//!
//! Eight damped comb filters in parallel followed by four allpass filters in
//! series, per channel, with the right channel's delay lines offset for stereo
//! spread. Delay lines are sized from the sample rate at construction and never
//! reallocated.

use super::ReverbSettings;

/// Comb filter delay line lengths (in samples at 44.1kHz)
const COMB_LENGTHS: [usize; 8] = [1116, 1188, 1277, 1356, 1422, 1491, 1557, 1617];

/// Allpass filter delay line lengths (in samples at 44.1kHz)
const ALLPASS_LENGTHS: [usize; 4] = [556, 441, 341, 225];

/// Stereo spread offset for the right channel (in samples at 44.1kHz)
const STEREO_SPREAD: usize = 23;

const FIXED_GAIN: f32 = 0.015;
const SCALE_DAMP: f32 = 0.4;
const SCALE_ROOM: f32 = 0.28;
const OFFSET_ROOM: f32 = 0.7;
const ALLPASS_FEEDBACK: f32 = 0.5;

#[inline]
fn flush_denormal(x: f32) -> f32 {
    if x.abs() < 1.0e-20 {
        0.0
    } else {
        x
    }
}

struct CombFilter {
    buffer: Vec<f32>,
    pos: usize,
    filter_state: f32,
}

impl CombFilter {
    fn new(length: usize) -> Self {
        Self {
            buffer: vec![0.0; length.max(1)],
            pos: 0,
            filter_state: 0.0,
        }
    }

    #[inline]
    fn process(&mut self, input: f32, feedback: f32, damp: f32) -> f32 {
        let output = self.buffer[self.pos];

        // One-pole lowpass in the feedback path
        self.filter_state = flush_denormal(output * (1.0 - damp) + self.filter_state * damp);

        self.buffer[self.pos] = input + self.filter_state * feedback;
        self.pos = (self.pos + 1) % self.buffer.len();

        output
    }

    fn reset(&mut self) {
        self.buffer.fill(0.0);
        self.filter_state = 0.0;
        self.pos = 0;
    }
}

struct AllpassFilter {
    buffer: Vec<f32>,
    pos: usize,
}

impl AllpassFilter {
    fn new(length: usize) -> Self {
        Self {
            buffer: vec![0.0; length.max(1)],
            pos: 0,
        }
    }

    #[inline]
    fn process(&mut self, input: f32) -> f32 {
        let buffered = self.buffer[self.pos];
        let output = -input + buffered;
        self.buffer[self.pos] = flush_denormal(input + buffered * ALLPASS_FEEDBACK);
        self.pos = (self.pos + 1) % self.buffer.len();
        output
    }

    fn reset(&mut self) {
        self.buffer.fill(0.0);
        self.pos = 0;
    }
}

/// One channel's filter network
struct Tank {
    combs: Vec<CombFilter>,
    allpasses: Vec<AllpassFilter>,
}

impl Tank {
    fn new(scale: f32, spread: usize) -> Self {
        let scaled = |len: usize| ((len + spread) as f32 * scale) as usize;
        Self {
            combs: COMB_LENGTHS.iter().map(|&l| CombFilter::new(scaled(l))).collect(),
            allpasses: ALLPASS_LENGTHS
                .iter()
                .map(|&l| AllpassFilter::new(scaled(l)))
                .collect(),
        }
    }

    #[inline]
    fn process(&mut self, input: f32, feedback: f32, damp: f32) -> f32 {
        let mut out = 0.0;
        for comb in &mut self.combs {
            out += comb.process(input, feedback, damp);
        }
        for allpass in &mut self.allpasses {
            out = allpass.process(out);
        }
        out
    }

    fn reset(&mut self) {
        self.combs.iter_mut().for_each(CombFilter::reset);
        self.allpasses.iter_mut().for_each(AllpassFilter::reset);
    }
}

/// Stereo reverb stage
///
/// Mono buffers use the left tank only. Channels beyond the first two pass
/// through at the dry level.
pub struct Reverb {
    left: Tank,
    right: Tank,
    feedback: f32,
    damp: f32,
    wet: f32,
    wet1: f32,
    wet2: f32,
    dry: f32,
}

impl Reverb {
    pub fn new(sample_rate: u32) -> Self {
        let scale = sample_rate as f32 / 44100.0;
        let mut reverb = Self {
            left: Tank::new(scale, 0),
            right: Tank::new(scale, STEREO_SPREAD),
            feedback: 0.0,
            damp: 0.0,
            wet: 0.0,
            wet1: 0.0,
            wet2: 0.0,
            dry: 1.0,
        };
        reverb.set(&ReverbSettings::default());
        reverb
    }

    /// Update parameters; takes effect from the next processed frame
    pub fn set(&mut self, settings: &ReverbSettings) {
        let width = settings.width.clamp(0.0, 1.0);
        self.feedback = settings.room_size.clamp(0.0, 1.0) * SCALE_ROOM + OFFSET_ROOM;
        self.damp = settings.damp.clamp(0.0, 1.0) * SCALE_DAMP;
        self.wet = settings.wet_mix.clamp(0.0, 1.0);
        self.wet1 = self.wet * (width / 2.0 + 0.5);
        self.wet2 = self.wet * ((1.0 - width) / 2.0);
        self.dry = settings.dry_mix.clamp(0.0, 1.0);
    }

    /// Process an interleaved buffer in place
    pub fn process(&mut self, buffer: &mut [f32], channels: usize) {
        match channels {
            0 => {}
            1 => {
                for sample in buffer.iter_mut() {
                    let dry = *sample;
                    let out = self.left.process(dry * FIXED_GAIN, self.feedback, self.damp);
                    *sample = out * self.wet + dry * self.dry;
                }
            }
            _ => {
                for frame in buffer.chunks_exact_mut(channels) {
                    let (in_l, in_r) = (frame[0], frame[1]);
                    let input = (in_l + in_r) * FIXED_GAIN;
                    let out_l = self.left.process(input, self.feedback, self.damp);
                    let out_r = self.right.process(input, self.feedback, self.damp);

                    frame[0] = out_l * self.wet1 + out_r * self.wet2 + in_l * self.dry;
                    frame[1] = out_r * self.wet1 + out_l * self.wet2 + in_r * self.dry;
                    for sample in frame.iter_mut().skip(2) {
                        *sample *= self.dry;
                    }
                }
            }
        }
    }

    pub fn reset(&mut self) {
        self.left.reset();
        self.right.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(wet: f32, dry: f32) -> ReverbSettings {
        ReverbSettings {
            enabled: true,
            wet_mix: wet,
            dry_mix: dry,
            ..ReverbSettings::default()
        }
    }

    #[test]
    fn test_fully_wet_impulse_has_tail() {
        let mut reverb = Reverb::new(48000);
        reverb.set(&settings(1.0, 0.0));

        let mut first = vec![0.0f32; 512];
        first[0] = 1.0;
        first[1] = 1.0;
        reverb.process(&mut first, 2);

        let mut tail_energy = 0.0;
        for _ in 0..16 {
            let mut silence = vec![0.0f32; 512];
            reverb.process(&mut silence, 2);
            tail_energy += silence.iter().map(|s| s * s).sum::<f32>();
        }
        assert!(tail_energy > 0.0);
    }

    #[test]
    fn test_fully_dry_is_identity() {
        let mut reverb = Reverb::new(44100);
        reverb.set(&settings(0.0, 1.0));

        let input: Vec<f32> = (0..256).map(|i| ((i as f32) * 0.1).sin()).collect();
        let mut buffer = input.clone();
        reverb.process(&mut buffer, 1);
        assert_eq!(buffer, input);
    }
}
