//! Deterministic driver for offline runs and tests
//!
//! The clock only moves when [`SimulatedDriver::advance`] is called. Each
//! period invokes every registered callback once, in registration order, with
//! one buffer of input taken from the device's feed (silence when the feed is
//! empty) and appends whatever the callback wrote to the output device's sink.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::driver::{
    AudioCallback, AudioDriver, CallbackFlow, CallbackInfo, DriverBinding, StreamConfig,
};
use super::status::{Faults, StreamStatus};
use crate::device::{Device, DeviceId};
use crate::error::{StreamError, StreamResult};

struct SimStream {
    callback: Box<dyn AudioCallback>,
    status: Arc<StreamStatus>,
    input: Option<(DeviceId, usize)>,
    output: Option<(DeviceId, usize)>,
    frames_per_buffer: usize,
    complete: bool,
    input_buf: Vec<f32>,
    output_buf: Vec<f32>,
}

#[derive(Default)]
struct SimState {
    sample_rate: u32,
    frames_per_buffer: u32,
    clock_frames: u64,
    next_id: u64,
    streams: BTreeMap<u64, SimStream>,
    feeds: HashMap<DeviceId, VecDeque<f32>>,
    sinks: HashMap<DeviceId, Vec<f32>>,
    unavailable: HashSet<DeviceId>,
    disconnected: HashSet<DeviceId>,
}

/// Driver whose clock advances one buffer period at a time on request
#[derive(Clone)]
pub struct SimulatedDriver {
    inner: Arc<Mutex<SimState>>,
}

impl SimulatedDriver {
    /// `sample_rate` and `frames_per_buffer` define the clock period
    pub fn new(sample_rate: u32, frames_per_buffer: u32) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SimState {
                sample_rate,
                frames_per_buffer,
                ..Default::default()
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        // A panicking test thread must not wedge the others
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue interleaved samples to be delivered by an input device
    pub fn feed(&self, device: DeviceId, samples: &[f32]) {
        self.lock()
            .feeds
            .entry(device)
            .or_default()
            .extend(samples.iter().copied());
    }

    /// Take everything written to an output device so far
    pub fn take_output(&self, device: DeviceId) -> Vec<f32> {
        self.lock().sinks.remove(&device).unwrap_or_default()
    }

    /// Make future opens of a device fail with `DeviceUnavailable`
    pub fn set_unavailable(&self, device: DeviceId) {
        self.lock().unavailable.insert(device);
    }

    /// Simulate a device vanishing mid-stream: its streams get a fault and
    /// stop being invoked
    pub fn disconnect(&self, device: DeviceId) {
        let mut state = self.lock();
        state.disconnected.insert(device);
        state.unavailable.insert(device);
        for stream in state.streams.values() {
            let bound = stream.input.map(|(d, _)| d) == Some(device)
                || stream.output.map(|(d, _)| d) == Some(device);
            if bound {
                stream.status.raise(Faults::DEVICE_LOST);
            }
        }
    }

    /// Number of callbacks currently registered
    pub fn open_count(&self) -> usize {
        self.lock().streams.len()
    }

    pub fn period(&self) -> Duration {
        let state = self.lock();
        StreamConfig::new(state.sample_rate, state.frames_per_buffer).period()
    }

    /// Run `periods` driver periods
    pub fn advance(&self, periods: usize) {
        for _ in 0..periods {
            self.tick();
        }
    }

    /// Run enough periods to cover `duration`
    pub fn advance_for(&self, duration: Duration) {
        let periods = {
            let state = self.lock();
            let config = StreamConfig::new(state.sample_rate, state.frames_per_buffer);
            let frames = config.frames_for(duration);
            frames.div_ceil(state.frames_per_buffer.max(1) as u64) as usize
        };
        self.advance(periods);
    }

    fn tick(&self) {
        let mut guard = self.lock();
        let state = &mut *guard;
        let timestamp = Duration::from_secs_f64(
            state.clock_frames as f64 / state.sample_rate.max(1) as f64,
        );
        let info = CallbackInfo { timestamp };

        for stream in state.streams.values_mut() {
            let lost = stream
                .input
                .iter()
                .chain(stream.output.iter())
                .any(|(d, _)| state.disconnected.contains(d));
            if lost {
                continue;
            }

            if let Some((device, channels)) = stream.input {
                let len = stream.frames_per_buffer * channels;
                stream.input_buf.resize(len, 0.0);
                let feed = state.feeds.entry(device).or_default();
                for sample in stream.input_buf.iter_mut() {
                    *sample = feed.pop_front().unwrap_or(0.0);
                }
            }
            if let Some((_, channels)) = stream.output {
                let len = stream.frames_per_buffer * channels;
                stream.output_buf.clear();
                stream.output_buf.resize(len, 0.0);
            }

            if !stream.complete {
                let flow = stream
                    .callback
                    .process(&stream.input_buf, &mut stream.output_buf, &info);
                stream.complete = flow == CallbackFlow::Complete;
            }

            if let Some((device, _)) = stream.output {
                state
                    .sinks
                    .entry(device)
                    .or_default()
                    .extend_from_slice(&stream.output_buf);
            }
        }

        state.clock_frames += state.frames_per_buffer as u64;
    }

    fn register(
        &self,
        input: Option<&Device>,
        output: Option<&Device>,
        config: &StreamConfig,
        callback: Box<dyn AudioCallback>,
    ) -> StreamResult<Box<dyn DriverBinding>> {
        let mut state = self.lock();
        for device in input.iter().chain(output.iter()) {
            if state.unavailable.contains(&device.id) {
                return Err(StreamError::DeviceUnavailable(device.name.clone()));
            }
        }

        let id = state.next_id;
        state.next_id += 1;
        let status = callback.status();
        state.streams.insert(
            id,
            SimStream {
                callback,
                status,
                input: input.map(|d| (d.id, d.channels as usize)),
                output: output.map(|d| (d.id, d.channels as usize)),
                frames_per_buffer: config.frames_per_buffer as usize,
                complete: false,
                input_buf: Vec::new(),
                output_buf: Vec::new(),
            },
        );

        Ok(Box::new(SimBinding {
            driver: self.clone(),
            id: Some(id),
        }))
    }
}

struct SimBinding {
    driver: SimulatedDriver,
    id: Option<u64>,
}

impl DriverBinding for SimBinding {
    fn close(&mut self) {
        if let Some(id) = self.id.take() {
            // Drop the callback outside the lock: its Drop may do file I/O
            let removed = self.driver.lock().streams.remove(&id);
            drop(removed);
        }
    }
}

impl Drop for SimBinding {
    fn drop(&mut self) {
        self.close();
    }
}

impl AudioDriver for SimulatedDriver {
    fn now(&self) -> Duration {
        let state = self.lock();
        Duration::from_secs_f64(state.clock_frames as f64 / state.sample_rate.max(1) as f64)
    }

    fn open_input(
        &self,
        device: &Device,
        config: &StreamConfig,
        callback: Box<dyn AudioCallback>,
    ) -> StreamResult<Box<dyn DriverBinding>> {
        self.register(Some(device), None, config, callback)
    }

    fn open_output(
        &self,
        device: &Device,
        config: &StreamConfig,
        callback: Box<dyn AudioCallback>,
    ) -> StreamResult<Box<dyn DriverBinding>> {
        self.register(None, Some(device), config, callback)
    }

    fn open_duplex(
        &self,
        input: &Device,
        output: &Device,
        config: &StreamConfig,
        callback: Box<dyn AudioCallback>,
    ) -> StreamResult<Box<dyn DriverBinding>> {
        self.register(Some(input), Some(output), config, callback)
    }
}
