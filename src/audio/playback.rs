//! Playback stream - plays a WAV file on one output device
//!
//! Two roles share the implementation. The Player feeds the virtual input
//! device other applications listen to and ends at end of file. The Monitor
//! lets the user hear the same sound on their output device and keeps
//! emitting silence after the file runs out until it is stopped.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use hound::{SampleFormat, WavReader};

use super::driver::{
    AudioCallback, AudioDriver, CallbackFlow, CallbackInfo, DriverBinding, StreamConfig,
};
use super::status::{Faults, StreamState, StreamStatus};
use crate::device::Device;
use crate::error::{StreamError, StreamResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlaybackRole {
    Player,
    Monitor,
}

impl PlaybackRole {
    pub fn label(self) -> &'static str {
        match self {
            Self::Player => "Player",
            Self::Monitor => "Monitor",
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Encoding {
    Float,
    /// Integer PCM with its normalization factor
    Int(f32),
}

struct PlaybackCallback {
    reader: WavReader<BufReader<File>>,
    encoding: Encoding,
    status: Arc<StreamStatus>,
    role: PlaybackRole,
    channels: usize,
    frames: u64,
    exhausted: bool,
    started: bool,
}

impl PlaybackCallback {
    /// Copy the next samples into `output`; returns how many were read
    fn read_into(&mut self, output: &mut [f32]) -> usize {
        let mut read = 0;
        let mut failed = false;
        match self.encoding {
            Encoding::Float => {
                for (dst, sample) in output.iter_mut().zip(self.reader.samples::<f32>()) {
                    match sample {
                        Ok(value) => *dst = value,
                        Err(_) => {
                            failed = true;
                            break;
                        }
                    }
                    read += 1;
                }
            }
            Encoding::Int(scale) => {
                for (dst, sample) in output.iter_mut().zip(self.reader.samples::<i32>()) {
                    match sample {
                        Ok(value) => *dst = value as f32 * scale,
                        Err(_) => {
                            failed = true;
                            break;
                        }
                    }
                    read += 1;
                }
            }
        }
        if failed {
            self.status.raise(Faults::STORAGE);
        }
        read
    }
}

impl AudioCallback for PlaybackCallback {
    fn process(&mut self, _input: &[f32], output: &mut [f32], _info: &CallbackInfo) -> CallbackFlow {
        if self.status.stop_requested() {
            output.fill(0.0);
            self.status.set_state(StreamState::Idle);
            self.status.acknowledge_stop();
            return CallbackFlow::Complete;
        }
        if !self.started {
            self.started = true;
            self.status.set_state(StreamState::Playing);
        }

        let read = if self.exhausted {
            0
        } else {
            self.read_into(output)
        };
        // Short reads (end of file, read error) are padded with silence
        output[read..].fill(0.0);

        self.frames += (read / self.channels) as u64;
        self.status.set_frames(self.frames);

        if read < output.len() && !self.exhausted {
            self.exhausted = true;
            if self.role == PlaybackRole::Player {
                self.status.set_state(StreamState::Idle);
                self.status.mark_finished();
                self.status.acknowledge_stop();
                return CallbackFlow::Complete;
            }
        }
        CallbackFlow::Continue
    }

    fn status(&self) -> Arc<StreamStatus> {
        Arc::clone(&self.status)
    }
}

struct ActivePlayback {
    binding: Box<dyn DriverBinding>,
    status: Arc<StreamStatus>,
    source: PathBuf,
}

/// Plays files on one output device
pub struct PlaybackStream {
    role: PlaybackRole,
    device: Device,
    config: StreamConfig,
    active: Option<ActivePlayback>,
}

impl PlaybackStream {
    pub fn new(role: PlaybackRole, device: Device, config: StreamConfig) -> Self {
        Self {
            role,
            device,
            config,
            active: None,
        }
    }

    pub fn role(&self) -> PlaybackRole {
        self.role
    }

    pub fn device(&self) -> &Device {
        &self.device
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

    /// Frames delivered from the file so far
    pub fn frames(&self) -> u64 {
        self.active.as_ref().map(|a| a.status.frames()).unwrap_or(0)
    }

    /// Open `source` and start playing it. A sound already playing is stopped
    /// first.
    pub fn play(&mut self, driver: &dyn AudioDriver, source: &Path) -> StreamResult<()> {
        self.stop();

        let reader = WavReader::open(source)?;
        let spec = reader.spec();
        if spec.sample_rate != self.config.sample_rate {
            return Err(StreamError::FormatMismatch(format!(
                "{} is {} Hz, stream runs at {} Hz",
                source.display(),
                spec.sample_rate,
                self.config.sample_rate
            )));
        }
        if spec.channels != self.device.channels {
            return Err(StreamError::FormatMismatch(format!(
                "{} has {} channels, {} has {}",
                source.display(),
                spec.channels,
                self.device.name,
                self.device.channels
            )));
        }
        let encoding = match spec.sample_format {
            SampleFormat::Float => Encoding::Float,
            SampleFormat::Int => Encoding::Int(1.0 / (1u64 << (spec.bits_per_sample - 1)) as f32),
        };

        let status = Arc::new(StreamStatus::new());
        let callback = PlaybackCallback {
            reader,
            encoding,
            status: Arc::clone(&status),
            role: self.role,
            channels: self.device.channels.max(1) as usize,
            frames: 0,
            exhausted: false,
            started: false,
        };
        let binding = driver.open_output(&self.device, &self.config, Box::new(callback))?;

        log::info!(
            "{} playing {} on {}",
            self.role.label(),
            source.display(),
            self.device.name
        );
        self.active = Some(ActivePlayback {
            binding,
            status,
            source: source.to_path_buf(),
        });
        Ok(())
    }

    /// Stop playback and close the file. Safe at any point.
    pub fn stop(&mut self) {
        let Some(mut active) = self.active.take() else {
            return;
        };
        active.status.request_stop();
        if !active.status.wait_stopped(self.config.stop_timeout()) {
            log::debug!("{} did not acknowledge stop in time", self.role.label());
        }
        active.binding.close();
        log::info!("{} stopped on {}", self.role.label(), self.device.name);
    }

    /// Reap playback that ended on its own: end of file (Player) or device loss
    pub fn poll(&mut self) -> Option<StreamResult<PathBuf>> {
        let active = self.active.as_ref()?;
        let faults = active.status.faults();
        if faults.contains(Faults::DEVICE_LOST) {
            let source = active.source.clone();
            self.stop();
            return Some(Err(StreamError::StreamAborted(format!(
                "{} disconnected while playing {}",
                self.device.name,
                source.display()
            ))));
        }
        if faults.contains(Faults::STORAGE) {
            let source = active.source.clone();
            self.stop();
            return Some(Err(StreamError::Storage(format!(
                "Read from {} failed",
                source.display()
            ))));
        }
        if active.status.is_finished() {
            let source = active.source.clone();
            self.stop();
            return Some(Ok(source));
        }
        None
    }
}

impl Drop for PlaybackStream {
    fn drop(&mut self) {
        self.stop();
    }
}
