//! Capture stream - records one device to a WAV file
//!
//! Lifecycle: `Idle -> Armed -> Recording -> Finalizing -> Idle`. The file is
//! created on the control thread before the callback is registered; the
//! callback only appends samples to that pre-opened handle and writes the
//! header exactly once when it finishes or is dropped.

use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hound::{SampleFormat, WavSpec, WavWriter};

use super::driver::{
    AudioCallback, AudioDriver, CallbackFlow, CallbackInfo, DriverBinding, StreamConfig,
};
use super::status::{Faults, StreamState, StreamStatus};
use crate::device::Device;
use crate::error::{StreamError, StreamResult};

/// Per-arm options
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CaptureOptions {
    /// Driver clock instant that sample 0 of the file should correspond to.
    /// The first callback writes silence covering the gap from this instant
    /// to its own timestamp.
    pub pad_origin: Option<Duration>,
    /// Recording ends on its own once this much audio (padding included) is written
    pub max_file_length: Duration,
}

/// A finalized capture file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recording {
    pub path: PathBuf,
    /// Frames in the file, leading silence included
    pub frames: u64,
    pub padded_frames: u64,
}

fn wav_spec(channels: u16, sample_rate: u32) -> WavSpec {
    WavSpec {
        channels,
        sample_rate,
        bits_per_sample: 32,
        sample_format: SampleFormat::Float,
    }
}

struct CaptureCallback {
    writer: Option<WavWriter<BufWriter<File>>>,
    status: Arc<StreamStatus>,
    config: StreamConfig,
    channels: usize,
    pad_origin: Option<Duration>,
    padded: Arc<AtomicU64>,
    max_frames: u64,
    frames: u64,
    started: bool,
}

impl CaptureCallback {
    fn write_silence(writer: &mut WavWriter<BufWriter<File>>, samples: u64) -> hound::Result<()> {
        for _ in 0..samples {
            writer.write_sample(0.0f32)?;
        }
        Ok(())
    }

    /// Write the header and release the file. Safe to call repeatedly.
    fn finish(&mut self) {
        if let Some(writer) = self.writer.take() {
            self.status.set_state(StreamState::Finalizing);
            if writer.finalize().is_err() {
                self.status.raise(Faults::STORAGE);
            }
            self.status.set_state(StreamState::Idle);
        }
        self.status.acknowledge_stop();
    }

    fn fail(&mut self) -> CallbackFlow {
        self.status.raise(Faults::STORAGE);
        self.finish();
        CallbackFlow::Complete
    }
}

impl AudioCallback for CaptureCallback {
    fn process(&mut self, input: &[f32], _output: &mut [f32], info: &CallbackInfo) -> CallbackFlow {
        if self.writer.is_none() {
            return CallbackFlow::Complete;
        }
        if self.status.stop_requested() || self.status.faults().contains(Faults::DEVICE_LOST) {
            self.finish();
            return CallbackFlow::Complete;
        }

        if !self.started {
            self.started = true;
            self.status.set_state(StreamState::Recording);

            if let Some(origin) = self.pad_origin {
                let pad = self
                    .config
                    .frames_for(info.timestamp.saturating_sub(origin))
                    .min(self.max_frames);
                let written = match self.writer.as_mut() {
                    Some(writer) => Self::write_silence(writer, pad * self.channels as u64),
                    None => Ok(()),
                };
                if written.is_err() {
                    return self.fail();
                }
                self.frames = pad;
                self.padded.store(pad, Ordering::Release);
                self.status.set_frames(self.frames);
            }
        }

        if input.len() % self.channels != 0 {
            self.status.raise(Faults::MALFORMED);
            return CallbackFlow::Continue;
        }

        let available = (input.len() / self.channels) as u64;
        let take = available.min(self.max_frames.saturating_sub(self.frames));
        let samples = &input[..take as usize * self.channels];

        let mut failed = false;
        if let Some(writer) = self.writer.as_mut() {
            for &sample in samples {
                if writer.write_sample(sample).is_err() {
                    failed = true;
                    break;
                }
            }
        }
        if failed {
            return self.fail();
        }

        self.frames += take;
        self.status.set_frames(self.frames);

        if self.frames >= self.max_frames {
            self.status.mark_finished();
            self.finish();
            return CallbackFlow::Complete;
        }
        CallbackFlow::Continue
    }

    fn status(&self) -> Arc<StreamStatus> {
        Arc::clone(&self.status)
    }
}

impl Drop for CaptureCallback {
    fn drop(&mut self) {
        self.finish();
    }
}

struct ActiveCapture {
    binding: Box<dyn DriverBinding>,
    status: Arc<StreamStatus>,
    padded: Arc<AtomicU64>,
    path: PathBuf,
}

/// Records one input (or loopback) device
pub struct CaptureStream {
    device: Device,
    config: StreamConfig,
    active: Option<ActiveCapture>,
}

impl CaptureStream {
    pub fn new(device: Device, config: StreamConfig) -> Self {
        Self {
            device,
            config,
            active: None,
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn config(&self) -> StreamConfig {
        self.config
    }

    pub fn state(&self) -> StreamState {
        self.active
            .as_ref()
            .map(|a| a.status.state())
            .unwrap_or(StreamState::Idle)
    }

    /// True from a successful `arm` until the recording has been reaped
    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// Frames written so far by the current recording
    pub fn frames(&self) -> u64 {
        self.active.as_ref().map(|a| a.status.frames()).unwrap_or(0)
    }

    /// Create `dest` and start recording into it on the next driver buffer
    pub fn arm(
        &mut self,
        driver: &dyn AudioDriver,
        dest: &Path,
        options: CaptureOptions,
    ) -> StreamResult<()> {
        if self.active.is_some() {
            return Err(StreamError::Configuration(format!(
                "Capture on {} is already armed",
                self.device.name
            )));
        }

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        let writer = WavWriter::create(dest, wav_spec(self.device.channels, self.config.sample_rate))?;

        let status = Arc::new(StreamStatus::new());
        status.set_state(StreamState::Armed);
        let padded = Arc::new(AtomicU64::new(0));

        let callback = CaptureCallback {
            writer: Some(writer),
            status: Arc::clone(&status),
            config: self.config,
            channels: self.device.channels.max(1) as usize,
            pad_origin: options.pad_origin,
            padded: Arc::clone(&padded),
            max_frames: self.config.frames_for(options.max_file_length),
            frames: 0,
            started: false,
        };

        let binding = match driver.open_input(&self.device, &self.config, Box::new(callback)) {
            Ok(binding) => binding,
            Err(e) => {
                // The callback has been dropped and finalized the empty file
                if let Err(rm) = fs::remove_file(dest) {
                    log::warn!("Failed to remove {}: {}", dest.display(), rm);
                }
                return Err(e);
            }
        };

        log::info!("Capture armed on {} -> {}", self.device.name, dest.display());
        self.active = Some(ActiveCapture {
            binding,
            status,
            padded,
            path: dest.to_path_buf(),
        });
        Ok(())
    }

    /// Stop recording and finalize the file.
    ///
    /// Returns `Ok(None)` when nothing was recording. A device lost mid-stream
    /// yields `StreamAborted`; the partial file is still finalized.
    pub fn stop(&mut self) -> StreamResult<Option<Recording>> {
        let Some(mut active) = self.active.take() else {
            return Ok(None);
        };

        active.status.request_stop();
        if !active.status.wait_stopped(self.config.stop_timeout()) {
            log::debug!("Capture on {} did not acknowledge stop in time", self.device.name);
        }
        // Drops the callback, which finalizes the file if it has not already
        active.binding.close();

        let recording = Recording {
            path: active.path,
            frames: active.status.frames(),
            padded_frames: active.padded.load(Ordering::Acquire),
        };

        let faults = active.status.take_faults();
        if faults.contains(Faults::DEVICE_LOST) {
            log::warn!(
                "Capture on {} aborted, kept {} frames in {}",
                self.device.name,
                recording.frames,
                recording.path.display()
            );
            return Err(StreamError::StreamAborted(format!(
                "{} disconnected while recording {}",
                self.device.name,
                recording.path.display()
            )));
        }
        if faults.contains(Faults::STORAGE) {
            return Err(StreamError::Storage(format!(
                "Write to {} failed",
                recording.path.display()
            )));
        }

        log::info!(
            "Capture on {} stopped: {} frames -> {}",
            self.device.name,
            recording.frames,
            recording.path.display()
        );
        Ok(Some(recording))
    }

    /// Reap a recording that ended on its own (length ceiling, device loss,
    /// write failure)
    pub fn poll(&mut self) -> Option<StreamResult<Recording>> {
        let status = &self.active.as_ref()?.status;
        let faults = status.faults();
        let ended = status.is_finished()
            || faults.contains(Faults::DEVICE_LOST)
            || faults.contains(Faults::STORAGE);
        if ended {
            self.stop().transpose()
        } else {
            None
        }
    }
}

impl Drop for CaptureStream {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            log::warn!("Capture on {} ended with error: {}", self.device.name, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::SimulatedDriver;
    use crate::device::{DeviceId, DeviceKind, DeviceList, Direction};

    fn devices() -> DeviceList {
        let mut list = DeviceList::new();
        list.push("Mic-1", "Sim", DeviceKind::Input, Direction::Input, 1, 48000);
        list.push("Loopback", "Sim", DeviceKind::Loopback, Direction::Input, 1, 48000);
        list
    }

    fn options(max_secs: f64) -> CaptureOptions {
        CaptureOptions {
            pad_origin: None,
            max_file_length: Duration::from_secs_f64(max_secs),
        }
    }

    fn read_all(path: &Path) -> Vec<f32> {
        let mut reader = hound::WavReader::open(path).unwrap();
        reader.samples::<f32>().map(|s| s.unwrap()).collect()
    }

    #[test]
    fn test_max_length_stops_autonomously() {
        let dir = tempfile::tempdir().unwrap();
        let list = devices();
        let driver = SimulatedDriver::new(48000, 256);
        let config = StreamConfig::new(48000, 256);
        let mut capture = CaptureStream::new(list.get(DeviceId(0)).unwrap().clone(), config);
        let path = dir.path().join("take.wav");

        capture.arm(&driver, &path, options(2.0)).unwrap();
        assert_eq!(capture.state(), StreamState::Armed);

        driver.advance_for(Duration::from_secs_f64(2.5));
        assert_eq!(capture.state(), StreamState::Idle);

        let recording = capture.poll().unwrap().unwrap();
        assert_eq!(recording.frames, 96000);
        assert!(!capture.is_active());
        assert_eq!(driver.open_count(), 0);

        let reader = hound::WavReader::open(&path).unwrap();
        assert!((reader.duration() as i64 - 96000).abs() <= 256);
    }

    #[test]
    fn test_immediate_stop_leaves_nothing_open() {
        let dir = tempfile::tempdir().unwrap();
        let list = devices();
        let driver = SimulatedDriver::new(48000, 256);
        let mut capture = CaptureStream::new(
            list.get(DeviceId(0)).unwrap().clone(),
            StreamConfig::new(48000, 256),
        );
        let path = dir.path().join("empty.wav");

        capture.arm(&driver, &path, options(1.0)).unwrap();
        let recording = capture.stop().unwrap().unwrap();

        assert_eq!(recording.frames, 0);
        assert_eq!(driver.open_count(), 0);
        assert_eq!(capture.state(), StreamState::Idle);
        assert_eq!(hound::WavReader::open(&path).unwrap().duration(), 0);
    }

    #[test]
    fn test_stop_twice_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let list = devices();
        let mic = list.get(DeviceId(0)).unwrap().clone();
        let driver = SimulatedDriver::new(48000, 256);
        let mut capture = CaptureStream::new(mic.clone(), StreamConfig::new(48000, 256));
        let path = dir.path().join("twice.wav");

        capture.arm(&driver, &path, options(10.0)).unwrap();
        driver.feed(mic.id, &[0.25; 1024]);
        driver.advance(4);

        let first = capture.stop().unwrap().unwrap();
        let bytes = fs::read(&path).unwrap();
        assert!(capture.stop().unwrap().is_none());

        assert_eq!(first.frames, 1024);
        assert_eq!(fs::read(&path).unwrap(), bytes);
        assert_eq!(read_all(&path), vec![0.25; 1024]);
    }

    #[test]
    fn test_pad_aligns_two_captures() {
        let dir = tempfile::tempdir().unwrap();
        let list = devices();
        let mic = list.get(DeviceId(0)).unwrap().clone();
        let loopback = list.get(DeviceId(1)).unwrap().clone();
        let config = StreamConfig::new(48000, 256);
        let driver = SimulatedDriver::new(48000, 256);

        let ramp: Vec<f32> = (0..4096).map(|i| i as f32 / 4096.0).collect();
        driver.feed(mic.id, &ramp);
        // The loopback stream starts one buffer later and sees the same timeline
        driver.feed(loopback.id, &ramp[256..]);

        let origin = driver.now();
        let padded = |max| CaptureOptions {
            pad_origin: Some(origin),
            max_file_length: Duration::from_secs_f64(max),
        };

        let mut a = CaptureStream::new(mic, config);
        let mut b = CaptureStream::new(loopback, config);
        a.arm(&driver, &dir.path().join("a.wav"), padded(10.0)).unwrap();
        driver.advance(1);
        b.arm(&driver, &dir.path().join("b.wav"), padded(10.0)).unwrap();
        driver.advance(8);

        let ra = a.stop().unwrap().unwrap();
        let rb = b.stop().unwrap().unwrap();
        assert!(ra.padded_frames.abs_diff(rb.padded_frames) <= 256);
        assert_eq!(rb.padded_frames, 256);

        let (sa, sb) = (read_all(&ra.path), read_all(&rb.path));
        assert_eq!(sa.len(), sb.len());
        assert_eq!(&sa[256..], &sb[256..]);
    }

    #[test]
    fn test_stopping_one_capture_leaves_other_intact() {
        let dir = tempfile::tempdir().unwrap();
        let list = devices();
        let mic = list.get(DeviceId(0)).unwrap().clone();
        let loopback = list.get(DeviceId(1)).unwrap().clone();
        let config = StreamConfig::new(48000, 256);
        let driver = SimulatedDriver::new(48000, 256);

        driver.feed(mic.id, &[0.5; 2048]);
        driver.feed(loopback.id, &[-0.5; 2048]);

        let mut a = CaptureStream::new(mic, config);
        let mut b = CaptureStream::new(loopback, config);
        a.arm(&driver, &dir.path().join("a.wav"), options(10.0)).unwrap();
        b.arm(&driver, &dir.path().join("b.wav"), options(10.0)).unwrap();

        driver.advance(2);
        let ra = a.stop().unwrap().unwrap();
        driver.advance(6);
        let rb = b.stop().unwrap().unwrap();

        assert_eq!(ra.frames, 512);
        assert_eq!(rb.frames, 2048);
        assert_eq!(read_all(&ra.path), vec![0.5; 512]);
        assert_eq!(read_all(&rb.path), vec![-0.5; 2048]);
    }

    #[test]
    fn test_device_loss_aborts_and_keeps_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let list = devices();
        let mic = list.get(DeviceId(0)).unwrap().clone();
        let driver = SimulatedDriver::new(48000, 256);
        let mut capture = CaptureStream::new(mic.clone(), StreamConfig::new(48000, 256));
        let path = dir.path().join("lost.wav");

        capture.arm(&driver, &path, options(10.0)).unwrap();
        driver.advance(3);
        driver.disconnect(mic.id);
        driver.advance(3);

        let result = capture.poll().unwrap();
        assert!(matches!(result, Err(StreamError::StreamAborted(_))));
        assert_eq!(capture.state(), StreamState::Idle);
        assert_eq!(driver.open_count(), 0);
        assert_eq!(hound::WavReader::open(&path).unwrap().duration(), 768);
    }

    #[test]
    fn test_unavailable_device_stays_idle() {
        let dir = tempfile::tempdir().unwrap();
        let list = devices();
        let mic = list.get(DeviceId(0)).unwrap().clone();
        let driver = SimulatedDriver::new(48000, 256);
        driver.set_unavailable(mic.id);

        let mut capture = CaptureStream::new(mic, StreamConfig::new(48000, 256));
        let path = dir.path().join("never.wav");
        let result = capture.arm(&driver, &path, options(1.0));

        assert!(matches!(result, Err(StreamError::DeviceUnavailable(_))));
        assert_eq!(capture.state(), StreamState::Idle);
        assert!(!path.exists());
    }

    #[test]
    fn test_unwritable_destination_is_storage_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        fs::write(&blocker, b"x").unwrap();

        let list = devices();
        let driver = SimulatedDriver::new(48000, 256);
        let mut capture = CaptureStream::new(
            list.get(DeviceId(0)).unwrap().clone(),
            StreamConfig::new(48000, 256),
        );
        let result = capture.arm(&driver, &blocker.join("take.wav"), options(1.0));

        assert!(matches!(result, Err(StreamError::Storage(_))));
        assert_eq!(driver.open_count(), 0);
    }
}
