//! Audio backend trait for platform and simulated implementations
//!
//! A backend only knows how to list devices and how to run a raw interleaved
//! f32 callback on a device. Block assembly, metering and fault containment
//! live in the engine's I/O adapter, so every backend gets the same
//! real-time behaviour.
//!
//! - [`CpalBackend`](super::CpalBackend): real hardware through cpal
//! - [`VirtualBackend`](super::VirtualBackend): in-process devices driven by the caller

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel::Sender;

use super::device::{AudioDevice, DeviceId};
use super::error::AudioResult;
use crate::types::SlotId;

/// Capture callback: receives interleaved frames with `channels` samples each
pub type CaptureCallback = Box<dyn FnMut(&[f32]) + Send + 'static>;

/// Playback callback: fills interleaved frames with `channels` samples each
pub type PlaybackCallback = Box<dyn FnMut(&mut [f32]) + Send + 'static>;

/// Everything a backend needs to open one stream
#[derive(Clone)]
pub struct StreamRequest {
    pub slot: SlotId,
    pub device: DeviceId,
    pub channels: u16,
    pub sample_rate: u32,
    /// Preferred hardware buffer size in frames (the device may deliver other sizes)
    pub block_size: u32,
    /// Upper bound on building and starting the stream
    pub open_timeout: Duration,
    /// Fault and in-flight bookkeeping shared with the engine
    pub health: Arc<StreamHealth>,
}

/// An open stream
///
/// Dropping the handle stops the stream. `close` does the same but bounds
/// how long it waits for the platform to release the device.
pub trait AudioStream: Send {
    fn slot(&self) -> SlotId;

    fn device(&self) -> &DeviceId;

    /// Stop the stream and release the device
    ///
    /// After this returns (and `health().wait_idle()` succeeds) no callback
    /// for this stream runs again.
    fn close(self: Box<Self>, timeout: Duration);
}

/// Source of devices and streams
pub trait AudioBackend: Send + Sync {
    /// Short backend name for logs
    fn name(&self) -> &'static str;

    /// All devices with their capture/playback channel counts
    fn devices(&self) -> AudioResult<Vec<AudioDevice>>;

    fn open_input(
        &self,
        request: StreamRequest,
        callback: CaptureCallback,
    ) -> AudioResult<Box<dyn AudioStream>>;

    fn open_output(
        &self,
        request: StreamRequest,
        callback: PlaybackCallback,
    ) -> AudioResult<Box<dyn AudioStream>>;
}

/// Fault notice sent from a stream to the mix worker
#[derive(Debug, Clone)]
pub struct StreamFault {
    pub slot: SlotId,
    pub message: String,
    /// Faults on this stream so far
    pub faults: u32,
    /// Set once, when `faults` reaches the threshold
    pub escalate: bool,
}

/// Per-stream fault counter and in-flight callback tracker
///
/// Shared between the backend's error callback, the engine's data callbacks
/// and the controller.
pub struct StreamHealth {
    slot: SlotId,
    threshold: u32,
    in_flight: AtomicUsize,
    faults: AtomicU32,
    tripped: AtomicBool,
    alarm: Sender<StreamFault>,
}

impl StreamHealth {
    pub fn new(slot: SlotId, threshold: u32, alarm: Sender<StreamFault>) -> Self {
        Self {
            slot,
            threshold: threshold.max(1),
            in_flight: AtomicUsize::new(0),
            faults: AtomicU32::new(0),
            tripped: AtomicBool::new(false),
            alarm,
        }
    }

    pub fn slot(&self) -> SlotId {
        self.slot
    }

    /// Record a fault reported by the hardware layer or a panicking callback
    ///
    /// Never blocks: the notice is dropped if the worker is behind.
    pub fn report_fault(&self, message: &str) {
        let faults = self.faults.fetch_add(1, Ordering::Relaxed) + 1;
        let escalate = faults >= self.threshold && !self.tripped.swap(true, Ordering::AcqRel);
        log::warn!("Audio stream fault on {} ({}): {}", self.slot, faults, message);
        let _ = self.alarm.try_send(StreamFault {
            slot: self.slot,
            message: message.to_string(),
            faults,
            escalate,
        });
    }

    pub fn faults(&self) -> u32 {
        self.faults.load(Ordering::Relaxed)
    }

    /// Whether the fault threshold was reached
    pub fn is_tripped(&self) -> bool {
        self.tripped.load(Ordering::Acquire)
    }

    /// Mark a callback as running until the guard drops
    #[inline]
    pub fn enter(&self) -> CallbackGuard<'_> {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        CallbackGuard { health: self }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Wait until no callback is running, up to `timeout`
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.in_flight() > 0 {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }
        true
    }
}

/// Decrements the in-flight count on drop
pub struct CallbackGuard<'a> {
    health: &'a StreamHealth,
}

impl Drop for CallbackGuard<'_> {
    #[inline]
    fn drop(&mut self) {
        self.health.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}
