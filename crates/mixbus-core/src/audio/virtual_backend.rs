//! In-process audio backend
//!
//! Devices are registered by name with capture/playback channel counts.
//! Streams never run on their own: the caller drives capture with
//! [`VirtualBackend::capture`] and playback with [`VirtualBackend::render`],
//! synchronously on the calling thread. That makes engine behaviour
//! reproducible in tests and usable for offline simulation.
//!
//! The backend enforces the one-stream-per-device-per-direction rule, so a
//! stale stream left open by a buggy reconfigure shows up as
//! [`AudioError::DeviceBusy`].

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::backend::{
    AudioBackend, AudioStream, CaptureCallback, PlaybackCallback, StreamRequest,
};
use super::device::{AudioDevice, DeviceId};
use super::error::{AudioError, AudioResult};
use super::StreamHealth;
use crate::types::{Direction, SlotId};

/// Host label reported for virtual devices
pub const VIRTUAL_HOST: &str = "Virtual";

struct OpenStream {
    id: u64,
    health: Arc<StreamHealth>,
    channels: u16,
    callback: StreamCallback,
}

enum StreamCallback {
    Capture(CaptureCallback),
    Playback(PlaybackCallback),
}

#[derive(Default)]
struct VirtualState {
    devices: Vec<AudioDevice>,
    /// Keyed by (direction, device name)
    streams: HashMap<(Direction, String), OpenStream>,
    failing: HashSet<String>,
    enumeration_broken: bool,
    next_id: u64,
    opened_total: u64,
}

/// Simulated devices driven by the caller
///
/// Cloning yields another handle to the same devices and streams, so a test
/// can keep one handle after giving the engine another.
#[derive(Clone, Default)]
pub struct VirtualBackend {
    state: Arc<Mutex<VirtualState>>,
}

impl VirtualBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Backend with `inputs` capture-only and `outputs` playback-only stereo
    /// devices named "Virtual In N" / "Virtual Out N" (1-based)
    pub fn with_devices(inputs: usize, outputs: usize) -> Self {
        let backend = Self::new();
        for i in 1..=inputs {
            backend.add_device(&format!("Virtual In {}", i), 2, 0);
        }
        for o in 1..=outputs {
            backend.add_device(&format!("Virtual Out {}", o), 0, 2);
        }
        backend
    }

    fn lock(&self) -> MutexGuard<'_, VirtualState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a device; replaces an existing one with the same name
    pub fn add_device(&self, name: &str, input_channels: u16, output_channels: u16) {
        let mut state = self.lock();
        state.devices.retain(|d| d.name != name);
        state.devices.push(AudioDevice {
            id: DeviceId::with_host(name, VIRTUAL_HOST),
            name: name.to_string(),
            host: VIRTUAL_HOST.to_string(),
            max_input_channels: input_channels,
            max_output_channels: output_channels,
        });
    }

    /// Make every subsequent open on `name` fail (or succeed again)
    pub fn fail_opens(&self, name: &str, fail: bool) {
        let mut state = self.lock();
        if fail {
            state.failing.insert(name.to_string());
        } else {
            state.failing.remove(name);
        }
    }

    /// Make `devices()` fail
    pub fn break_enumeration(&self, broken: bool) {
        self.lock().enumeration_broken = broken;
    }

    /// Deliver interleaved frames to the capture stream on `name`
    ///
    /// Returns false if no capture stream is open on that device.
    pub fn capture(&self, name: &str, interleaved: &[f32]) -> bool {
        let mut state = self.lock();
        match state.streams.get_mut(&(Direction::Input, name.to_string())) {
            Some(OpenStream {
                callback: StreamCallback::Capture(callback),
                ..
            }) => {
                callback(interleaved);
                true
            }
            _ => false,
        }
    }

    /// Pull `frames` frames from the playback stream on `name`
    ///
    /// Returns `None` if no playback stream is open on that device.
    pub fn render(&self, name: &str, frames: usize) -> Option<Vec<f32>> {
        let mut state = self.lock();
        match state.streams.get_mut(&(Direction::Output, name.to_string())) {
            Some(OpenStream {
                channels,
                callback: StreamCallback::Playback(callback),
                ..
            }) => {
                let mut out = vec![0.0f32; frames * *channels as usize];
                callback(&mut out);
                Some(out)
            }
            _ => None,
        }
    }

    /// Report a hardware-level error on an open stream
    pub fn inject_fault(&self, direction: Direction, name: &str, message: &str) -> bool {
        let health = self
            .lock()
            .streams
            .get(&(direction, name.to_string()))
            .map(|s| s.health.clone());
        match health {
            Some(health) => {
                health.report_fault(message);
                true
            }
            None => false,
        }
    }

    pub fn is_open(&self, direction: Direction, name: &str) -> bool {
        self.lock().streams.contains_key(&(direction, name.to_string()))
    }

    /// Number of streams currently open, both directions
    pub fn open_stream_count(&self) -> usize {
        self.lock().streams.len()
    }

    /// Streams opened since creation, including closed ones
    pub fn total_opened(&self) -> u64 {
        self.lock().opened_total
    }

    /// Names of devices with an open stream in `direction`, sorted
    pub fn open_devices(&self, direction: Direction) -> Vec<String> {
        let mut names: Vec<String> = self
            .lock()
            .streams
            .keys()
            .filter(|(d, _)| *d == direction)
            .map(|(_, name)| name.clone())
            .collect();
        names.sort();
        names
    }

    fn open(
        &self,
        direction: Direction,
        request: StreamRequest,
        callback: StreamCallback,
    ) -> AudioResult<Box<dyn AudioStream>> {
        let mut state = self.lock();
        let name = request.device.name.clone();

        let device = state
            .devices
            .iter()
            .find(|d| d.name == name)
            .ok_or_else(|| AudioError::DeviceNotFound(request.device.display_label()))?;
        let available = match direction {
            Direction::Input => device.max_input_channels,
            Direction::Output => device.max_output_channels,
        };
        if available < request.channels {
            return Err(AudioError::ConfigError(format!(
                "{} has {} {} channels, {} requested",
                name, available, direction, request.channels
            )));
        }
        if state.failing.contains(&name) {
            return Err(AudioError::StreamBuildError(format!("{} refused to open", name)));
        }

        let key = (direction, name.clone());
        if state.streams.contains_key(&key) {
            return Err(AudioError::DeviceBusy(name));
        }

        state.next_id += 1;
        state.opened_total += 1;
        let id = state.next_id;
        state.streams.insert(
            key,
            OpenStream {
                id,
                health: request.health.clone(),
                channels: request.channels,
                callback,
            },
        );
        log::debug!("Virtual {} stream {} opened on {}", direction, id, name);

        Ok(Box::new(VirtualStream {
            backend: self.clone(),
            slot: request.slot,
            device: request.device,
            direction,
            id,
        }))
    }
}

impl AudioBackend for VirtualBackend {
    fn name(&self) -> &'static str {
        "virtual"
    }

    fn devices(&self) -> AudioResult<Vec<AudioDevice>> {
        let state = self.lock();
        if state.enumeration_broken {
            return Err(AudioError::Enumeration("virtual host unavailable".into()));
        }
        Ok(state.devices.clone())
    }

    fn open_input(
        &self,
        request: StreamRequest,
        callback: CaptureCallback,
    ) -> AudioResult<Box<dyn AudioStream>> {
        self.open(Direction::Input, request, StreamCallback::Capture(callback))
    }

    fn open_output(
        &self,
        request: StreamRequest,
        callback: PlaybackCallback,
    ) -> AudioResult<Box<dyn AudioStream>> {
        self.open(Direction::Output, request, StreamCallback::Playback(callback))
    }
}

/// Handle to a virtual stream; removes it from the backend on close or drop
pub struct VirtualStream {
    backend: VirtualBackend,
    slot: SlotId,
    device: DeviceId,
    direction: Direction,
    id: u64,
}

impl AudioStream for VirtualStream {
    fn slot(&self) -> SlotId {
        self.slot
    }

    fn device(&self) -> &DeviceId {
        &self.device
    }

    fn close(self: Box<Self>, _timeout: Duration) {}
}

impl Drop for VirtualStream {
    fn drop(&mut self) {
        let mut state = self.backend.lock();
        let key = (self.direction, self.device.name.clone());
        // Only remove our own stream, never a newer one on the same device
        if state.streams.get(&key).map(|s| s.id) == Some(self.id) {
            let removed = state.streams.remove(&key);
            drop(state);
            // Callback destructors run outside the backend lock
            drop(removed);
        }
    }
}
