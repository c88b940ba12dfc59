//! cpal implementation of the driver binding layer
//!
//! Streams are opened with a fixed buffer size. Devices whose native format is
//! `i16` are converted through a scratch buffer allocated when the stream is
//! built, so the data callbacks never allocate.
//!
//! cpal has no duplex stream, so a duplex binding is two streams joined by a
//! lock-free SPSC ring buffer: the input stream produces, the output stream
//! consumes and runs the callback. An empty ring reads as silence.

use std::sync::Arc;
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, SampleFormat, SampleRate};
use ringbuf::{
    traits::{Consumer, Producer, Split},
    HeapRb,
};

use super::driver::{
    AudioCallback, AudioDriver, CallbackFlow, CallbackInfo, DriverBinding, StreamConfig,
};
use super::status::{Faults, StreamStatus};
use crate::device::{host_name, Device, Direction};
use crate::error::{StreamError, StreamResult};

/// Ring capacity of a duplex bridge, in driver buffers
const BRIDGE_BUFFERS: usize = 4;

/// Driver backed by the system audio hosts
pub struct CpalDriver {
    epoch: Instant,
}

impl CpalDriver {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }
}

impl Default for CpalDriver {
    fn default() -> Self {
        Self::new()
    }
}

/// Keeps the cpal streams alive; dropping them stops the driver threads
struct CpalBinding {
    streams: Vec<cpal::Stream>,
}

impl DriverBinding for CpalBinding {
    fn close(&mut self) {
        for stream in self.streams.drain(..) {
            if let Err(e) = stream.pause() {
                log::debug!("Failed to pause stream before close: {}", e);
            }
        }
    }
}

impl Drop for CpalBinding {
    fn drop(&mut self) {
        self.close();
    }
}

fn find_by_name(
    mut devices: impl Iterator<Item = cpal::Device>,
    name: &str,
) -> Option<cpal::Device> {
    devices.find(|d| d.name().map(|n| n == name).unwrap_or(false))
}

/// Find the cpal device behind an enumerated [`Device`]
fn resolve(device: &Device) -> StreamResult<cpal::Device> {
    let host_id = cpal::available_hosts()
        .into_iter()
        .find(|id| host_name(*id) == device.host)
        .ok_or_else(|| {
            StreamError::DeviceUnavailable(format!("Host {} not available", device.host))
        })?;
    let host = cpal::host_from_id(host_id)
        .map_err(|e| StreamError::DeviceUnavailable(e.to_string()))?;

    let found = match device.direction {
        Direction::Input => host
            .input_devices()
            .ok()
            .and_then(|devices| find_by_name(devices, &device.name)),
        Direction::Output => host
            .output_devices()
            .ok()
            .and_then(|devices| find_by_name(devices, &device.name)),
    };

    found.ok_or_else(|| StreamError::DeviceUnavailable(device.name.clone()))
}

fn native_format(cpal_device: &cpal::Device, direction: Direction) -> StreamResult<SampleFormat> {
    let config = match direction {
        Direction::Input => cpal_device.default_input_config(),
        Direction::Output => cpal_device.default_output_config(),
    };
    config
        .map(|c| c.sample_format())
        .map_err(|e| StreamError::DeviceUnavailable(e.to_string()))
}

fn cpal_config(device: &Device, config: &StreamConfig) -> cpal::StreamConfig {
    cpal::StreamConfig {
        channels: device.channels,
        sample_rate: SampleRate(config.sample_rate),
        buffer_size: BufferSize::Fixed(config.frames_per_buffer),
    }
}

fn build_error(device: &Device, e: cpal::BuildStreamError) -> StreamError {
    match e {
        cpal::BuildStreamError::StreamConfigNotSupported => StreamError::FormatMismatch(format!(
            "{} does not support the requested stream config",
            device.name
        )),
        other => StreamError::DeviceUnavailable(format!("{}: {}", device.name, other)),
    }
}

/// Error hook run by cpal off the data path
fn error_handler(status: Arc<StreamStatus>, label: String) -> impl FnMut(cpal::StreamError) + Send + 'static {
    move |err| {
        log::error!("Audio stream error on {}: {}", label, err);
        if matches!(err, cpal::StreamError::DeviceNotAvailable) {
            status.raise(Faults::DEVICE_LOST);
        }
    }
}

impl CpalDriver {
    /// Build a capture stream delivering `f32` chunks of at most one buffer
    fn build_input<F>(
        &self,
        device: &Device,
        config: &StreamConfig,
        status: Arc<StreamStatus>,
        mut sink: F,
    ) -> StreamResult<cpal::Stream>
    where
        F: FnMut(&[f32], &CallbackInfo) + Send + 'static,
    {
        let cpal_device = resolve(device)?;
        let format = native_format(&cpal_device, device.direction)?;
        let stream_config = cpal_config(device, config);
        let chunk_len = (config.frames_per_buffer as usize * device.channels as usize).max(1);
        let epoch = self.epoch;
        let on_error = error_handler(status, device.name.clone());

        let stream = match format {
            SampleFormat::F32 => cpal_device.build_input_stream(
                &stream_config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    let info = CallbackInfo {
                        timestamp: epoch.elapsed(),
                    };
                    for chunk in data.chunks(chunk_len) {
                        sink(chunk, &info);
                    }
                },
                on_error,
                None,
            ),
            SampleFormat::I16 => {
                let mut scratch = vec![0.0f32; chunk_len];
                cpal_device.build_input_stream(
                    &stream_config,
                    move |data: &[i16], _: &cpal::InputCallbackInfo| {
                        let info = CallbackInfo {
                            timestamp: epoch.elapsed(),
                        };
                        for chunk in data.chunks(chunk_len) {
                            let buf = &mut scratch[..chunk.len()];
                            for (dst, &src) in buf.iter_mut().zip(chunk) {
                                *dst = src as f32 / 32768.0;
                            }
                            sink(buf, &info);
                        }
                    },
                    on_error,
                    None,
                )
            }
            other => {
                return Err(StreamError::FormatMismatch(format!(
                    "Unsupported sample format: {:?}",
                    other
                )))
            }
        }
        .map_err(|e| build_error(device, e))?;

        Ok(stream)
    }

    /// Build a playback stream pulling `f32` chunks of at most one buffer
    fn build_output<F>(
        &self,
        device: &Device,
        config: &StreamConfig,
        status: Arc<StreamStatus>,
        mut source: F,
    ) -> StreamResult<cpal::Stream>
    where
        F: FnMut(&mut [f32], &CallbackInfo) + Send + 'static,
    {
        let cpal_device = resolve(device)?;
        let format = native_format(&cpal_device, device.direction)?;
        let stream_config = cpal_config(device, config);
        let chunk_len = (config.frames_per_buffer as usize * device.channels as usize).max(1);
        let epoch = self.epoch;
        let on_error = error_handler(status, device.name.clone());

        let stream = match format {
            SampleFormat::F32 => cpal_device.build_output_stream(
                &stream_config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let info = CallbackInfo {
                        timestamp: epoch.elapsed(),
                    };
                    for chunk in data.chunks_mut(chunk_len) {
                        source(chunk, &info);
                    }
                },
                on_error,
                None,
            ),
            SampleFormat::I16 => {
                let mut scratch = vec![0.0f32; chunk_len];
                cpal_device.build_output_stream(
                    &stream_config,
                    move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                        let info = CallbackInfo {
                            timestamp: epoch.elapsed(),
                        };
                        for chunk in data.chunks_mut(chunk_len) {
                            let buf = &mut scratch[..chunk.len()];
                            source(buf, &info);
                            for (dst, &src) in chunk.iter_mut().zip(buf.iter()) {
                                *dst = (src.clamp(-1.0, 1.0) * 32767.0) as i16;
                            }
                        }
                    },
                    on_error,
                    None,
                )
            }
            other => {
                return Err(StreamError::FormatMismatch(format!(
                    "Unsupported sample format: {:?}",
                    other
                )))
            }
        }
        .map_err(|e| build_error(device, e))?;

        Ok(stream)
    }
}

fn start(stream: &cpal::Stream, device: &Device) -> StreamResult<()> {
    stream
        .play()
        .map_err(|e| StreamError::DeviceUnavailable(format!("{}: {}", device.name, e)))
}

impl AudioDriver for CpalDriver {
    fn now(&self) -> Duration {
        self.epoch.elapsed()
    }

    fn open_input(
        &self,
        device: &Device,
        config: &StreamConfig,
        mut callback: Box<dyn AudioCallback>,
    ) -> StreamResult<Box<dyn DriverBinding>> {
        let status = callback.status();
        let mut done = false;
        let stream = self.build_input(device, config, status, move |data, info| {
            if done {
                return;
            }
            done = callback.process(data, &mut [], info) == CallbackFlow::Complete;
        })?;
        start(&stream, device)?;

        log::info!("Input stream started on {}", device.name);
        Ok(Box::new(CpalBinding {
            streams: vec![stream],
        }))
    }

    fn open_output(
        &self,
        device: &Device,
        config: &StreamConfig,
        mut callback: Box<dyn AudioCallback>,
    ) -> StreamResult<Box<dyn DriverBinding>> {
        let status = callback.status();
        let mut done = false;
        let stream = self.build_output(device, config, status, move |data, info| {
            if done {
                data.fill(0.0);
                return;
            }
            done = callback.process(&[], data, info) == CallbackFlow::Complete;
        })?;
        start(&stream, device)?;

        log::info!("Output stream started on {}", device.name);
        Ok(Box::new(CpalBinding {
            streams: vec![stream],
        }))
    }

    fn open_duplex(
        &self,
        input: &Device,
        output: &Device,
        config: &StreamConfig,
        mut callback: Box<dyn AudioCallback>,
    ) -> StreamResult<Box<dyn DriverBinding>> {
        let status = callback.status();
        let chunk_len = (config.frames_per_buffer as usize * output.channels as usize).max(1);

        let rb = HeapRb::<f32>::new(chunk_len * BRIDGE_BUFFERS);
        let (mut producer, mut consumer) = rb.split();
        // One buffer of silence absorbs jitter between the two driver threads
        for _ in 0..chunk_len {
            let _ = producer.try_push(0.0);
        }

        let input_stream = self.build_input(input, config, Arc::clone(&status), move |data, _| {
            for &sample in data {
                let _ = producer.try_push(sample);
            }
        })?;

        let mut bridged = vec![0.0f32; chunk_len];
        let mut done = false;
        let output_stream = self.build_output(output, config, status, move |data, info| {
            if done {
                data.fill(0.0);
                return;
            }
            let input = &mut bridged[..data.len().min(chunk_len)];
            for sample in input.iter_mut() {
                *sample = consumer.try_pop().unwrap_or(0.0);
            }
            done = callback.process(input, data, info) == CallbackFlow::Complete;
        })?;

        start(&input_stream, input)?;
        start(&output_stream, output)?;

        log::info!("Duplex stream started: {} -> {}", input.name, output.name);
        Ok(Box::new(CpalBinding {
            streams: vec![input_stream, output_stream],
        }))
    }
}
