//! Passthrough stream - live input routed through the effects chain to an output
//!
//! Effect settings reach the callback through a single `SharedCell` slot and a
//! generation counter. Each `set_effects` replaces the slot, so the newest
//! snapshot always wins. The callback checks the generation at the start of
//! each buffer and takes the whole snapshot, so one buffer is always processed
//! with one consistent set of parameters. Snapshots the callback released are
//! freed by the stream's `Collector` on the control thread.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use basedrop::{Collector, Shared, SharedCell};

use super::driver::{
    AudioCallback, AudioDriver, CallbackFlow, CallbackInfo, DriverBinding, StreamConfig,
};
use super::status::{Faults, StreamState, StreamStatus};
use crate::device::Device;
use crate::effects::{EffectSettings, EffectsChain};
use crate::error::{StreamError, StreamResult};

struct PassthroughCallback {
    chain: EffectsChain,
    settings: Arc<SharedCell<EffectSettings>>,
    generation: Arc<AtomicU64>,
    applied: u64,
    status: Arc<StreamStatus>,
    channels: usize,
    frames: u64,
    started: bool,
}

impl AudioCallback for PassthroughCallback {
    fn process(&mut self, input: &[f32], output: &mut [f32], _info: &CallbackInfo) -> CallbackFlow {
        if self.status.stop_requested() {
            output.fill(0.0);
            self.status.set_state(StreamState::Idle);
            self.status.acknowledge_stop();
            return CallbackFlow::Complete;
        }
        if !self.started {
            self.started = true;
            self.status.set_state(StreamState::Routing);
        }

        let generation = self.generation.load(Ordering::Acquire);
        if generation != self.applied {
            self.applied = generation;
            let settings = self.settings.get();
            self.chain.apply(*settings);
        }

        if !self.chain.process(input, output) {
            self.status.raise(Faults::MALFORMED);
        }

        self.frames += (output.len() / self.channels) as u64;
        self.status.set_frames(self.frames);
        CallbackFlow::Continue
    }

    fn status(&self) -> Arc<StreamStatus> {
        Arc::clone(&self.status)
    }
}

struct ActivePassthrough {
    binding: Box<dyn DriverBinding>,
    status: Arc<StreamStatus>,
    settings: Arc<SharedCell<EffectSettings>>,
    generation: Arc<AtomicU64>,
    detected: Arc<AtomicU32>,
}

/// Routes one input device to one output device under a single callback
pub struct PassthroughStream {
    input: Device,
    output: Device,
    config: StreamConfig,
    settings: EffectSettings,
    active: Option<ActivePassthrough>,
    collector: Collector,
}

impl PassthroughStream {
    /// Pair two devices. Differing channel counts or sample rates are refused:
    /// the stream never resamples or remixes.
    pub fn new(input: Device, output: Device, config: StreamConfig) -> StreamResult<Self> {
        if input.channels != output.channels {
            return Err(StreamError::Configuration(format!(
                "Passthrough {} ({} ch) -> {} ({} ch): channel counts differ",
                input.name, input.channels, output.name, output.channels
            )));
        }
        if input.default_sample_rate != output.default_sample_rate {
            return Err(StreamError::Configuration(format!(
                "Passthrough {} ({} Hz) -> {} ({} Hz): sample rates differ",
                input.name, input.default_sample_rate, output.name, output.default_sample_rate
            )));
        }
        Ok(Self {
            input,
            output,
            config,
            settings: EffectSettings::bypass(),
            active: None,
            collector: Collector::new(),
        })
    }

    pub fn input(&self) -> &Device {
        &self.input
    }

    pub fn output(&self) -> &Device {
        &self.output
    }

    pub fn state(&self) -> StreamState {
        self.active
            .as_ref()
            .map(|a| a.status.state())
            .unwrap_or(StreamState::Idle)
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// Settings most recently handed to the callback
    pub fn effects(&self) -> EffectSettings {
        self.settings
    }

    /// Start routing with `settings` in effect from the first buffer
    pub fn start(&mut self, driver: &dyn AudioDriver, settings: EffectSettings) -> StreamResult<()> {
        self.stop();

        let mut chain = EffectsChain::new(
            self.config.sample_rate,
            self.input.channels,
            self.config.frames_per_buffer as usize,
        );
        chain.apply(settings);
        let detected = chain.published_frequency();

        let cell = Arc::new(SharedCell::new(Shared::new(&self.collector.handle(), settings)));
        let generation = Arc::new(AtomicU64::new(0));
        let status = Arc::new(StreamStatus::new());
        status.set_state(StreamState::Armed);

        let callback = PassthroughCallback {
            chain,
            settings: Arc::clone(&cell),
            generation: Arc::clone(&generation),
            applied: 0,
            status: Arc::clone(&status),
            channels: self.input.channels.max(1) as usize,
            frames: 0,
            started: false,
        };
        let binding = driver.open_duplex(&self.input, &self.output, &self.config, Box::new(callback))?;

        log::info!("Passthrough started: {} -> {}", self.input.name, self.output.name);
        self.settings = settings;
        self.active = Some(ActivePassthrough {
            binding,
            status,
            settings: cell,
            generation,
            detected,
        });
        Ok(())
    }

    /// Swap the effect settings; the callback picks them up at its next buffer
    pub fn set_effects(&mut self, settings: EffectSettings) {
        self.settings = settings;
        if let Some(active) = self.active.as_ref() {
            active
                .settings
                .set(Shared::new(&self.collector.handle(), settings));
            active.generation.fetch_add(1, Ordering::Release);
        }
        self.collector.collect();
    }

    /// Latest fundamental estimated by the autotune detector
    pub fn detected_pitch(&self) -> Option<f32> {
        let bits = self.active.as_ref()?.detected.load(Ordering::Relaxed);
        let frequency = f32::from_bits(bits);
        (frequency > 0.0).then_some(frequency)
    }

    pub fn stop(&mut self) {
        let Some(mut active) = self.active.take() else {
            return;
        };
        active.status.request_stop();
        if !active.status.wait_stopped(self.config.stop_timeout()) {
            log::debug!("Passthrough did not acknowledge stop in time");
        }
        active.binding.close();
        drop(active);
        self.collector.collect();
        log::info!("Passthrough stopped: {} -> {}", self.input.name, self.output.name);
    }

    /// Report device loss; the stream is torn down when one occurred
    pub fn poll(&mut self) -> Option<StreamError> {
        self.collector.collect();
        let faults = self.active.as_ref()?.status.take_faults();
        if faults.contains(Faults::MALFORMED) {
            log::warn!("Passthrough replaced a malformed buffer with silence");
        }
        if faults.contains(Faults::DEVICE_LOST) {
            self.stop();
            return Some(StreamError::StreamAborted(format!(
                "Passthrough {} -> {} lost its device",
                self.input.name, self.output.name
            )));
        }
        None
    }
}

impl Drop for PassthroughStream {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::SimulatedDriver;
    use crate::device::{DeviceId, DeviceKind, DeviceList, Direction};
    use crate::effects::ReverbSettings;

    fn devices() -> DeviceList {
        let mut list = DeviceList::new();
        list.push("Mic-1", "Sim", DeviceKind::Input, Direction::Input, 1, 48000);
        list.push("CABLE Input", "Sim", DeviceKind::VirtualInput, Direction::Output, 1, 48000);
        list.push("Speakers", "Sim", DeviceKind::Output, Direction::Output, 2, 48000);
        list.push("Mic-44k", "Sim", DeviceKind::Input, Direction::Input, 1, 44100);
        list
    }

    fn reverb(wet: f32, dry: f32) -> EffectSettings {
        EffectSettings {
            reverb: ReverbSettings {
                enabled: true,
                wet_mix: wet,
                dry_mix: dry,
                ..ReverbSettings::default()
            },
            ..EffectSettings::bypass()
        }
    }

    fn stream(list: &DeviceList) -> PassthroughStream {
        PassthroughStream::new(
            list.get(DeviceId(0)).unwrap().clone(),
            list.get(DeviceId(1)).unwrap().clone(),
            StreamConfig::new(48000, 256),
        )
        .unwrap()
    }

    fn impulse() -> Vec<f32> {
        let mut buffer = vec![0.0f32; 256];
        buffer[0] = 1.0;
        buffer
    }

    #[test]
    fn test_mismatched_devices_are_refused() {
        let list = devices();
        let config = StreamConfig::new(48000, 256);
        let mic = list.get(DeviceId(0)).unwrap().clone();

        let stereo = PassthroughStream::new(mic.clone(), list.get(DeviceId(2)).unwrap().clone(), config);
        assert!(matches!(stereo, Err(StreamError::Configuration(_))));

        let slow = PassthroughStream::new(
            list.get(DeviceId(3)).unwrap().clone(),
            list.get(DeviceId(1)).unwrap().clone(),
            config,
        );
        assert!(matches!(slow, Err(StreamError::Configuration(_))));
    }

    #[test]
    fn test_wet_reverb_leaves_tail() {
        let list = devices();
        let driver = SimulatedDriver::new(48000, 256);
        let mut passthrough = stream(&list);

        passthrough.start(&driver, reverb(1.0, 0.0)).unwrap();
        driver.feed(DeviceId(0), &impulse());
        driver.advance(16);

        let output = driver.take_output(DeviceId(1));
        assert_eq!(output.len(), 16 * 256);
        assert!(output[256..].iter().any(|&s| s != 0.0));
        assert_eq!(passthrough.state(), StreamState::Routing);
    }

    #[test]
    fn test_dry_reverb_reproduces_input() {
        let list = devices();
        let driver = SimulatedDriver::new(48000, 256);
        let mut passthrough = stream(&list);

        let input: Vec<f32> = (0..1024).map(|i| ((i * 13) % 64) as f32 / 64.0 - 0.5).collect();
        passthrough.start(&driver, reverb(0.0, 1.0)).unwrap();
        driver.feed(DeviceId(0), &input);
        driver.advance(4);

        assert_eq!(driver.take_output(DeviceId(1)), input);
    }

    #[test]
    fn test_settings_swap_applies_next_buffer() {
        let list = devices();
        let driver = SimulatedDriver::new(48000, 256);
        let mut passthrough = stream(&list);

        passthrough.start(&driver, EffectSettings::bypass()).unwrap();
        driver.feed(DeviceId(0), &[0.5; 512]);
        driver.advance(1);
        passthrough.set_effects(reverb(0.0, 0.0));
        driver.advance(1);

        let output = driver.take_output(DeviceId(1));
        assert!(output[..256].iter().all(|&s| s == 0.5));
        assert!(output[256..].iter().all(|&s| s == 0.0));
        assert_eq!(passthrough.effects(), reverb(0.0, 0.0));
    }

    #[test]
    fn test_start_then_stop_unregisters() {
        let list = devices();
        let driver = SimulatedDriver::new(48000, 256);
        let mut passthrough = stream(&list);

        passthrough.start(&driver, EffectSettings::bypass()).unwrap();
        assert_eq!(driver.open_count(), 1);
        passthrough.stop();
        passthrough.stop();
        assert_eq!(driver.open_count(), 0);
        assert_eq!(passthrough.state(), StreamState::Idle);
    }

    #[test]
    fn test_device_loss_is_reported() {
        let list = devices();
        let driver = SimulatedDriver::new(48000, 256);
        let mut passthrough = stream(&list);

        passthrough.start(&driver, EffectSettings::bypass()).unwrap();
        driver.advance(1);
        driver.disconnect(DeviceId(1));

        assert!(matches!(passthrough.poll(), Some(StreamError::StreamAborted(_))));
        assert!(!passthrough.is_active());
        assert_eq!(driver.open_count(), 0);
    }

    #[test]
    fn test_latest_settings_win_after_many_swaps() {
        let list = devices();
        let driver = SimulatedDriver::new(48000, 256);
        let mut passthrough = stream(&list);

        passthrough.start(&driver, EffectSettings::bypass()).unwrap();
        for _ in 0..64 {
            passthrough.set_effects(reverb(0.0, 0.0));
        }
        passthrough.set_effects(EffectSettings::bypass());

        driver.feed(DeviceId(0), &[0.5; 256]);
        driver.advance(1);

        let output = driver.take_output(DeviceId(1));
        assert!(passthrough.effects().is_bypass());
        assert!(output.iter().all(|&s| s == 0.5));
    }
}
