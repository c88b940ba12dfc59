//! Driver binding layer
//!
//! Each stream kind implements [`AudioCallback`] over its own state and hands a
//! boxed instance to an [`AudioDriver`]. The driver invokes it from its
//! real-time thread until the returned [`DriverBinding`] is closed.

use std::sync::Arc;
use std::time::Duration;

use super::status::StreamStatus;
use crate::device::Device;
use crate::error::StreamResult;

/// Extra time granted on top of two buffer periods when waiting for a stop
const STOP_MARGIN: Duration = Duration::from_millis(10);

/// Parameters fixed for the lifetime of one stream instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamConfig {
    pub sample_rate: u32,
    pub frames_per_buffer: u32,
}

impl StreamConfig {
    pub fn new(sample_rate: u32, frames_per_buffer: u32) -> Self {
        Self {
            sample_rate,
            frames_per_buffer,
        }
    }

    /// Duration of one driver buffer
    pub fn period(&self) -> Duration {
        Duration::from_secs_f64(self.frames_per_buffer as f64 / self.sample_rate.max(1) as f64)
    }

    /// Bounded wait for a callback to acknowledge a stop request
    pub fn stop_timeout(&self) -> Duration {
        self.period() * 2 + STOP_MARGIN
    }

    /// Number of frames covering `duration` at this sample rate
    pub fn frames_for(&self, duration: Duration) -> u64 {
        (duration.as_secs_f64() * self.sample_rate as f64).round() as u64
    }
}

/// Per-invocation information from the driver
#[derive(Debug, Clone, Copy, Default)]
pub struct CallbackInfo {
    /// Driver clock time at which this buffer starts
    pub timestamp: Duration,
}

/// What the callback wants after an invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackFlow {
    Continue,
    /// Nothing more to do; further invocations produce silence
    Complete,
}

/// Real-time callback contract.
///
/// `process` runs on the driver thread: it must not block, allocate or log.
/// Interleaved `f32` buffers; `input` is empty for output-only streams and
/// `output` is empty for input-only streams.
pub trait AudioCallback: Send + 'static {
    fn process(&mut self, input: &[f32], output: &mut [f32], info: &CallbackInfo) -> CallbackFlow;

    /// Status shared with the owner; drivers raise device faults through it
    fn status(&self) -> Arc<StreamStatus>;
}

/// A registered callback. Dropping or closing it unregisters the callback.
pub trait DriverBinding {
    /// Stop pulling buffers. Once this returns the callback has been dropped
    /// and will never run again.
    fn close(&mut self);
}

/// Opens streams on devices and drives their callbacks
pub trait AudioDriver: Send {
    /// Current driver clock time, on the same scale as [`CallbackInfo::timestamp`]
    fn now(&self) -> Duration;

    fn open_input(
        &self,
        device: &Device,
        config: &StreamConfig,
        callback: Box<dyn AudioCallback>,
    ) -> StreamResult<Box<dyn DriverBinding>>;

    fn open_output(
        &self,
        device: &Device,
        config: &StreamConfig,
        callback: Box<dyn AudioCallback>,
    ) -> StreamResult<Box<dyn DriverBinding>>;

    /// One callback fed by `input` and writing to `output`
    fn open_duplex(
        &self,
        input: &Device,
        output: &Device,
        config: &StreamConfig,
        callback: Box<dyn AudioCallback>,
    ) -> StreamResult<Box<dyn DriverBinding>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_period_and_frames() {
        let config = StreamConfig::new(48000, 256);
        assert_eq!(config.frames_for(Duration::from_secs(2)), 96000);
        assert!((config.period().as_secs_f64() - 256.0 / 48000.0).abs() < 1e-9);
        assert!(config.stop_timeout() > config.period() * 2);
    }
}
