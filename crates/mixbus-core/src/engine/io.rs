//! Device I/O adapter
//!
//! Turns backend streams into engine streams:
//!
//! - **Capture**: frames are assembled into fixed-size blocks in a staging
//!   buffer and published to the slot's cell (latest wins). Every callback
//!   writes the left/right RMS of what it received to the slot's meter.
//! - **Playback**: the latest mixed block is fetched at each block boundary
//!   and played out frame by frame. If no new block is available the current
//!   one repeats; before the first block there is silence.
//!
//! Callbacks never block, never allocate and never unwind: a panic inside a
//! callback is caught, the callback outputs silence and a fault is counted on
//! the stream's [`StreamHealth`].

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::channel::Sender;

use super::cell::EMPTY_SEQUENCE;
use super::channel::{InputChannel, OutputBus};
use crate::audio::{
    AudioBackend, AudioError, AudioResult, AudioStream, CaptureCallback, DeviceId,
    PlaybackCallback, StreamFault, StreamHealth, StreamRequest,
};
use crate::config::EngineConfig;
use crate::types::{SlotId, StereoSample, CHANNELS};

/// Receives captured audio for one input slot
pub trait CaptureSink: Send + Sync + 'static {
    /// A full block was assembled (called from the audio thread)
    fn block_captured(&self, block: &[StereoSample]);

    /// Left/right RMS of one callback's worth of frames
    fn level(&self, left: f32, right: f32);
}

/// Supplies mixed audio for one output bus
pub trait PlaybackSource: Send + Sync + 'static {
    /// Copy the latest mixed block into `out`
    ///
    /// Returns false when nothing was mixed yet or the block is momentarily
    /// contended. Must not block.
    fn next_block(&self, out: &mut [StereoSample]) -> bool;
}

impl CaptureSink for InputChannel {
    #[inline]
    fn block_captured(&self, block: &[StereoSample]) {
        self.captured.try_publish(block);
    }

    #[inline]
    fn level(&self, left: f32, right: f32) {
        self.meter.store(left, right);
    }
}

impl PlaybackSource for OutputBus {
    #[inline]
    fn next_block(&self, out: &mut [StereoSample]) -> bool {
        if self.mixed.is_empty() {
            return false;
        }
        matches!(self.mixed.try_snapshot_into(out), Some(seq) if seq != EMPTY_SEQUENCE)
    }
}

/// Stream format shared by every stream the adapter opens
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamFormat {
    pub channels: u16,
    pub sample_rate: u32,
    pub block_size: u32,
}

impl StreamFormat {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            channels: CHANNELS,
            sample_rate: config.sample_rate,
            block_size: config.block_size,
        }
    }
}

/// Capture callback state; everything is allocated before the stream opens
struct CaptureState {
    sink: Arc<dyn CaptureSink>,
    channels: usize,
    staging: Vec<StereoSample>,
    filled: usize,
}

impl CaptureState {
    fn process(&mut self, data: &[f32]) {
        let mut sum_l = 0.0f32;
        let mut sum_r = 0.0f32;
        let mut frames = 0usize;

        for frame in data.chunks_exact(self.channels) {
            let sample = match frame {
                [mono] => StereoSample::mono(*mono),
                [left, right, ..] => StereoSample::new(*left, *right),
                [] => continue,
            };
            sum_l += sample.left * sample.left;
            sum_r += sample.right * sample.right;
            frames += 1;

            self.staging[self.filled] = sample;
            self.filled += 1;
            if self.filled == self.staging.len() {
                self.sink.block_captured(&self.staging);
                self.filled = 0;
            }
        }

        if frames > 0 {
            let n = frames as f32;
            self.sink.level((sum_l / n).sqrt(), (sum_r / n).sqrt());
        }
    }

    fn into_callback(mut self, health: Arc<StreamHealth>) -> CaptureCallback {
        Box::new(move |data: &[f32]| {
            let _guard = health.enter();
            let result = panic::catch_unwind(AssertUnwindSafe(|| self.process(data)));
            if result.is_err() {
                self.filled = 0;
                health.report_fault("capture callback panicked");
            }
        })
    }
}

/// Playback callback state
struct PlaybackState {
    source: Arc<dyn PlaybackSource>,
    channels: usize,
    current: Vec<StereoSample>,
    position: usize,
}

impl PlaybackState {
    fn process(&mut self, data: &mut [f32]) {
        for frame in data.chunks_exact_mut(self.channels) {
            if self.position == self.current.len() {
                // Keeps the previous block on failure
                self.source.next_block(&mut self.current);
                self.position = 0;
            }
            let sample = self.current[self.position];
            self.position += 1;

            match frame {
                [mono] => *mono = 0.5 * (sample.left + sample.right),
                [left, right, rest @ ..] => {
                    *left = sample.left;
                    *right = sample.right;
                    rest.fill(0.0);
                }
                [] => {}
            }
        }
    }

    fn into_callback(mut self, health: Arc<StreamHealth>) -> PlaybackCallback {
        Box::new(move |data: &mut [f32]| {
            let _guard = health.enter();
            let result = panic::catch_unwind(AssertUnwindSafe(|| self.process(data)));
            if result.is_err() {
                data.fill(0.0);
                health.report_fault("playback callback panicked");
            }
        })
    }
}

struct OpenStream {
    stream: Box<dyn AudioStream>,
    health: Arc<StreamHealth>,
}

/// Owns every open stream of an engine
pub struct IoAdapter {
    backend: Arc<dyn AudioBackend>,
    format: StreamFormat,
    open_timeout: Duration,
    drain_timeout: Duration,
    fault_threshold: u32,
    alarm: Sender<StreamFault>,
    streams: Vec<OpenStream>,
}

impl IoAdapter {
    pub fn new(
        backend: Arc<dyn AudioBackend>,
        config: &EngineConfig,
        alarm: Sender<StreamFault>,
    ) -> Self {
        Self {
            backend,
            format: StreamFormat::from_config(config),
            open_timeout: config.open_timeout(),
            drain_timeout: config.drain_timeout(),
            fault_threshold: config.fault_threshold,
            alarm,
            streams: Vec::new(),
        }
    }

    fn request(&self, slot: SlotId, device: &DeviceId) -> StreamRequest {
        StreamRequest {
            slot,
            device: device.clone(),
            channels: self.format.channels,
            sample_rate: self.format.sample_rate,
            block_size: self.format.block_size,
            open_timeout: self.open_timeout,
            health: Arc::new(StreamHealth::new(slot, self.fault_threshold, self.alarm.clone())),
        }
    }

    fn wrap_open_error(slot: SlotId, device: &DeviceId, source: AudioError) -> AudioError {
        log::error!("Failed to open {} on {}: {}", slot, device.display_label(), source);
        AudioError::StreamOpen {
            slot,
            device: device.name.clone(),
            source: Box::new(source),
        }
    }

    /// One stream per device and direction, whatever the backend allows
    fn claim(&self, slot: SlotId, device: &DeviceId) -> AudioResult<()> {
        let taken = self.streams.iter().any(|s| {
            s.stream.slot().direction == slot.direction && s.stream.device() == device
        });
        if taken {
            return Err(Self::wrap_open_error(
                slot,
                device,
                AudioError::DeviceBusy(device.display_label()),
            ));
        }
        Ok(())
    }

    /// Open a capture stream delivering blocks to `sink`
    pub fn open_input(
        &mut self,
        slot: SlotId,
        device: &DeviceId,
        sink: Arc<dyn CaptureSink>,
    ) -> AudioResult<()> {
        self.claim(slot, device)?;
        let request = self.request(slot, device);
        let health = request.health.clone();
        let state = CaptureState {
            sink,
            channels: request.channels.max(1) as usize,
            staging: vec![StereoSample::silence(); request.block_size as usize],
            filled: 0,
        };

        let stream = self
            .backend
            .open_input(request, state.into_callback(health.clone()))
            .map_err(|e| Self::wrap_open_error(slot, device, e))?;
        self.streams.push(OpenStream { stream, health });
        Ok(())
    }

    /// Open a playback stream pulling blocks from `source`
    pub fn open_output(
        &mut self,
        slot: SlotId,
        device: &DeviceId,
        source: Arc<dyn PlaybackSource>,
    ) -> AudioResult<()> {
        self.claim(slot, device)?;
        let request = self.request(slot, device);
        let health = request.health.clone();
        let state = PlaybackState {
            source,
            channels: request.channels.max(1) as usize,
            current: vec![StereoSample::silence(); request.block_size as usize],
            position: request.block_size as usize,
        };

        let stream = self
            .backend
            .open_output(request, state.into_callback(health.clone()))
            .map_err(|e| Self::wrap_open_error(slot, device, e))?;
        self.streams.push(OpenStream { stream, health });
        Ok(())
    }

    pub fn open_count(&self) -> usize {
        self.streams.len()
    }

    pub fn is_open(&self, slot: SlotId) -> bool {
        self.streams.iter().any(|s| s.stream.slot() == slot)
    }

    /// Close every stream and wait for in-flight callbacks to finish
    ///
    /// Returns false if some callback was still running when the drain
    /// timeout ran out.
    pub fn close_all(&mut self) -> bool {
        if self.streams.is_empty() {
            return true;
        }
        let count = self.streams.len();
        let started = Instant::now();

        let mut healths = Vec::with_capacity(count);
        for open in self.streams.drain(..) {
            healths.push(open.health);
            open.stream.close(self.drain_timeout);
        }

        let drained = healths.iter().all(|h| {
            let idle = h.wait_idle(self.drain_timeout);
            if !idle {
                log::warn!("{} callback still running after close", h.slot());
            }
            idle
        });

        log::info!("Closed {} streams in {:?}", count, started.elapsed());
        drained
    }
}

impl Drop for IoAdapter {
    fn drop(&mut self) {
        self.close_all();
    }
}
