//! Lock-free status shared between a stream's callback and the control thread
//!
//! The callback owns all of its working state. The only things that cross the
//! thread boundary are the atomics in [`StreamStatus`]: a stop request flowing
//! in, and state, acknowledgements, fault bits and a frame counter flowing out.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::thread;
use std::time::{Duration, Instant};

/// Lifecycle state of a stream instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum StreamState {
    #[default]
    Idle = 0,
    /// Callback registered, first buffer not yet seen
    Armed = 1,
    Recording = 2,
    Playing = 3,
    /// Passthrough routing input to output
    Routing = 4,
    /// Writing the file header and closing
    Finalizing = 5,
}

impl StreamState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Armed,
            2 => Self::Recording,
            3 => Self::Playing,
            4 => Self::Routing,
            5 => Self::Finalizing,
            _ => Self::Idle,
        }
    }
}

/// Out-of-band fault bits raised from the real-time path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Faults(u8);

impl Faults {
    /// The driver reported the device as gone
    pub const DEVICE_LOST: Faults = Faults(1);
    /// A file read or write failed
    pub const STORAGE: Faults = Faults(1 << 1);
    /// A buffer had an unexpected size and was replaced by silence
    pub const MALFORMED: Faults = Faults(1 << 2);

    pub fn contains(self, other: Faults) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

/// Atomics shared by one stream's callback and its owner
#[derive(Debug, Default)]
pub struct StreamStatus {
    state: AtomicU8,
    stop_requested: AtomicBool,
    stopped: AtomicBool,
    finished: AtomicBool,
    faults: AtomicU8,
    frames: AtomicU64,
}

impl StreamStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> StreamState {
        StreamState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: StreamState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Ask the callback to stop at its next invocation
    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::Release);
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
    }

    /// Called by the callback once it will touch no more resources
    pub fn acknowledge_stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Set when the stream ended on its own (length ceiling, end of file)
    pub fn mark_finished(&self) {
        self.finished.store(true, Ordering::Release);
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    pub fn raise(&self, faults: Faults) {
        self.faults.fetch_or(faults.0, Ordering::AcqRel);
    }

    pub fn faults(&self) -> Faults {
        Faults(self.faults.load(Ordering::Acquire))
    }

    /// Read and clear the fault bits
    pub fn take_faults(&self) -> Faults {
        Faults(self.faults.swap(0, Ordering::AcqRel))
    }

    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Acquire)
    }

    pub fn set_frames(&self, frames: u64) {
        self.frames.store(frames, Ordering::Release);
    }

    /// Wait for the callback to acknowledge a stop request.
    ///
    /// Returns false when the deadline passed first; the owner then closes the
    /// driver binding, which guarantees the callback never runs again.
    pub fn wait_stopped(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.is_stopped() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_fault_bits_accumulate_and_clear() {
        let status = StreamStatus::new();
        status.raise(Faults::MALFORMED);
        status.raise(Faults::DEVICE_LOST);

        let faults = status.take_faults();
        assert!(faults.contains(Faults::MALFORMED));
        assert!(faults.contains(Faults::DEVICE_LOST));
        assert!(!faults.contains(Faults::STORAGE));
        assert!(status.faults().is_empty());
    }

    #[test]
    fn test_state_round_trips_through_atomic() {
        let status = StreamStatus::new();
        assert_eq!(status.state(), StreamState::Idle);
        status.set_state(StreamState::Finalizing);
        assert_eq!(status.state(), StreamState::Finalizing);
    }

    #[test]
    fn test_wait_stopped_sees_ack_from_other_thread() {
        let status = Arc::new(StreamStatus::new());
        let remote = Arc::clone(&status);
        let handle = thread::spawn(move || {
            while !remote.stop_requested() {
                thread::sleep(Duration::from_millis(1));
            }
            remote.acknowledge_stop();
        });

        status.request_stop();
        assert!(status.wait_stopped(Duration::from_secs(2)));
        let _ = handle.join();
    }

    #[test]
    fn test_wait_stopped_is_bounded() {
        let status = StreamStatus::new();
        let start = Instant::now();
        assert!(!status.wait_stopped(Duration::from_millis(5)));
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
