//! Engine controller - lifecycle, setters and read-side API
//!
//! # Lifecycle
//!
//! ```text
//!            start()                 (streams open, worker spawned)
//!   Idle ─────────────► Starting ─────────────────────────► Running
//!    ▲                     │ open failed:                      │
//!    │                     │ close partial streams,            │ stop()
//!    │◄────────────────────┘ report StreamOpenFailure          ▼
//!    └─────────────────────────────────────────────────── Stopping
//! ```
//!
//! `start()` also *arms* the engine: until `stop()`, any device selection
//! reconfigures the streams, including after a failed start, so picking
//! another device is how the user retries.
//!
//! Every lifecycle operation runs under one controller mutex, so overlapping
//! reconfigurations are serialized and can never race on a device. Setters
//! for faders, gains and routing are plain atomic stores and never wait for
//! the controller.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread;

use crossbeam::channel::{self, Receiver};

use super::channel::{InputChannel, InputStatus, OutputBus, OutputStatus};
use super::events::{EngineEvent, EventBus};
use super::io::IoAdapter;
use super::mixer::Mixer;
use super::scheduler::MixScheduler;
use crate::audio::{
    compatible_devices, AudioBackend, AudioDevice, AudioError, AudioResult, CpalBackend, DeviceId,
    StreamFault,
};
use crate::config::EngineConfig;
use crate::dsp::{is_valid_gain, Band};
use crate::types::{Direction, StereoBuffer};

/// Fault notices buffered between the audio threads and the mix worker
const FAULT_QUEUE: usize = 64;

/// Engine lifecycle state
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineState {
    Idle = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
}

impl EngineState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => EngineState::Starting,
            2 => EngineState::Running,
            3 => EngineState::Stopping,
            _ => EngineState::Idle,
        }
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EngineState::Idle => "idle",
            EngineState::Starting => "starting",
            EngineState::Running => "running",
            EngineState::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

/// State only touched under the controller lock
struct Control {
    io: IoAdapter,
    scheduler: Option<MixScheduler>,
}

/// Shared engine internals
///
/// Owned by [`Engine`]; the mix worker and recovery threads only hold weak
/// references.
pub(crate) struct EngineCore {
    this: Weak<EngineCore>,
    config: EngineConfig,
    backend_name: &'static str,
    input_devices: Vec<AudioDevice>,
    output_devices: Vec<AudioDevice>,
    inputs: Vec<Arc<InputChannel>>,
    outputs: Vec<Arc<OutputBus>>,
    mixer: Mutex<Mixer>,
    events: EventBus,
    state: AtomicU8,
    armed: AtomicBool,
    recovering: AtomicBool,
    faults: Receiver<StreamFault>,
    control: Mutex<Control>,
}

impl EngineCore {
    fn lock_control(&self) -> MutexGuard<'_, Control> {
        self.control.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_mixer(&self) -> MutexGuard<'_, Mixer> {
        self.mixer.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn state(&self) -> EngineState {
        EngineState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: EngineState) {
        let previous = EngineState::from_u8(self.state.swap(state as u8, Ordering::AcqRel));
        if previous != state {
            log::info!("Engine {} -> {}", previous, state);
            self.events.publish(EngineEvent::StateChanged(state));
        }
    }

    /// Mix one tick into every bus and publish the meters
    pub(crate) fn tick(&self) {
        {
            let mut mixer = self.lock_mixer();
            let blocks = mixer.mix_tick(&self.inputs);
            for (bus, block) in self.outputs.iter().zip(blocks) {
                bus.mixed.store(block);
                let (left, right) = block.rms();
                bus.meter.store(left, right);
            }
        }

        self.events.publish(EngineEvent::LevelsUpdated {
            inputs: self.inputs.iter().map(|i| i.meter()).collect(),
            outputs: self.outputs.iter().map(|o| o.meter()).collect(),
        });
    }

    /// Report queued stream faults; a stream past the threshold triggers recovery
    pub(crate) fn handle_faults(&self) {
        for fault in self.faults.try_iter() {
            self.events.publish(EngineEvent::error(&AudioError::CallbackFault {
                slot: fault.slot,
                message: fault.message.clone(),
            }));

            if fault.escalate {
                let err = AudioError::StreamFailed {
                    slot: fault.slot,
                    faults: fault.faults,
                };
                log::error!("{}", err);
                self.events.publish(EngineEvent::error(&err));
                self.spawn_recovery();
            }
        }
    }

    /// Reconfigure on a separate thread; the mix worker must not block on
    /// the controller lock
    fn spawn_recovery(&self) {
        if self.recovering.swap(true, Ordering::AcqRel) {
            return;
        }
        let core = self.this.clone();
        let spawned = thread::Builder::new()
            .name("mixbus-recovery".into())
            .spawn(move || {
                if let Some(core) = core.upgrade() {
                    core.recover();
                    core.recovering.store(false, Ordering::Release);
                }
            });
        if let Err(e) = spawned {
            log::error!("Failed to spawn recovery thread: {}", e);
            self.recovering.store(false, Ordering::Release);
        }
    }

    fn recover(&self) {
        let mut control = self.lock_control();
        if self.state() != EngineState::Running {
            return;
        }
        log::warn!("Reopening streams after repeated faults");
        if let Err(e) = self.reconfigure_locked(&mut control) {
            log::error!("Recovery failed: {}", e);
        }
    }

    /// Silence every cell and meter and drop filter history
    fn clear_buffers(&self) {
        for input in &self.inputs {
            input.captured.clear();
            input.meter.reset();
        }
        for output in &self.outputs {
            output.mixed.clear();
            output.meter.reset();
        }
        self.lock_mixer().reset();
    }

    /// Open streams for exactly the slots with a device selected
    fn open_streams(&self, io: &mut IoAdapter) -> AudioResult<()> {
        for input in &self.inputs {
            if let Some(device) = input.device() {
                io.open_input(input.slot(), &device, input.clone())?;
            }
        }
        for output in &self.outputs {
            if let Some(device) = output.device() {
                io.open_output(output.slot(), &device, output.clone())?;
            }
        }
        Ok(())
    }

    /// Tear everything down after a failed (re)start and report it
    fn fail_start(&self, control: &mut Control, err: AudioError) -> AudioError {
        if self.state() == EngineState::Running {
            self.set_state(EngineState::Stopping);
        }
        if let Some(mut scheduler) = control.scheduler.take() {
            scheduler.stop();
        }
        control.io.close_all();
        self.clear_buffers();
        self.set_state(EngineState::Idle);

        log::error!("{}", err);
        self.events.publish(EngineEvent::error(&err));
        err
    }

    fn start_locked(&self, control: &mut Control) -> AudioResult<()> {
        if self.state() == EngineState::Running {
            return Ok(());
        }

        self.set_state(EngineState::Starting);
        self.clear_buffers();
        while self.faults.try_recv().is_ok() {}

        if let Err(e) = self.open_streams(&mut control.io) {
            return Err(self.fail_start(control, e));
        }
        match MixScheduler::spawn(self.this.clone(), self.config.mix_interval()) {
            Ok(scheduler) => control.scheduler = Some(scheduler),
            Err(e) => return Err(self.fail_start(control, e)),
        }

        self.set_state(EngineState::Running);
        log::info!(
            "Engine running on {} with {} streams ({:.1} ms blocks)",
            self.backend_name,
            control.io.open_count(),
            self.config.block_latency_ms()
        );
        Ok(())
    }

    fn stop_locked(&self, control: &mut Control) {
        if self.state() == EngineState::Idle {
            return;
        }
        self.set_state(EngineState::Stopping);
        if let Some(mut scheduler) = control.scheduler.take() {
            scheduler.stop();
        }
        control.io.close_all();
        self.clear_buffers();
        self.set_state(EngineState::Idle);
    }

    fn reconfigure_locked(&self, control: &mut Control) -> AudioResult<()> {
        if self.state() != EngineState::Running {
            // A failed start left the engine idle but armed: this is the retry
            return if self.armed.load(Ordering::Acquire) {
                self.start_locked(control)
            } else {
                Ok(())
            };
        }

        log::info!("Reconfiguring audio streams");
        if !control.io.close_all() {
            log::warn!("Reopening with callbacks still in flight");
        }
        let settle = self.config.settle_delay();
        if !settle.is_zero() {
            thread::sleep(settle);
        }
        self.clear_buffers();
        // Notices from the streams just closed no longer apply
        while self.faults.try_recv().is_ok() {}

        if let Err(e) = self.open_streams(&mut control.io) {
            return Err(self.fail_start(control, e));
        }
        log::info!("Reconfigured with {} streams", control.io.open_count());
        Ok(())
    }
}

/// Accept a device from the compatible list, returning its canonical ID
///
/// An ID without a host matches a listed device by name alone.
fn resolve_device(devices: &[AudioDevice], id: &DeviceId) -> Option<DeviceId> {
    devices
        .iter()
        .find(|d| d.id == *id)
        .or_else(|| match id.host {
            None => devices.iter().find(|d| d.name == id.name),
            Some(_) => None,
        })
        .map(|d| d.id.clone())
}

/// The mixing engine
///
/// Construct it with a backend, select devices, set faders, gains and
/// routing, then [`start`](Engine::start). Dropping the engine stops it.
pub struct Engine {
    core: Arc<EngineCore>,
}

impl Engine {
    /// Create an engine over `backend`
    ///
    /// Fails with a device enumeration error if the backend cannot list its
    /// devices or has fewer compatible devices than the configuration requires.
    pub fn new(config: EngineConfig, backend: Arc<dyn AudioBackend>) -> AudioResult<Self> {
        config.validate()?;

        let devices = backend.devices().map_err(|e| match e {
            AudioError::Enumeration(message) => AudioError::Enumeration(message),
            other => AudioError::Enumeration(other.to_string()),
        })?;
        let input_devices = compatible_devices(&devices, Direction::Input);
        let output_devices = compatible_devices(&devices, Direction::Output);

        if input_devices.len() < config.min_input_devices {
            return Err(AudioError::InsufficientDevices {
                direction: Direction::Input,
                found: input_devices.len(),
                required: config.min_input_devices,
            });
        }
        if output_devices.len() < config.min_output_devices {
            return Err(AudioError::InsufficientDevices {
                direction: Direction::Output,
                found: output_devices.len(),
                required: config.min_output_devices,
            });
        }

        log::info!(
            "{} backend: {} input and {} output devices, {} inputs x {} buses",
            backend.name(),
            input_devices.len(),
            output_devices.len(),
            config.num_inputs,
            config.num_outputs
        );

        let block_size = config.block_size as usize;
        let (alarm_tx, alarm_rx) = channel::bounded(FAULT_QUEUE);
        let core = Arc::new_cyclic(|this| EngineCore {
            this: this.clone(),
            backend_name: backend.name(),
            input_devices,
            output_devices,
            inputs: (0..config.num_inputs)
                .map(|i| Arc::new(InputChannel::new(i, block_size, config.default_fader)))
                .collect(),
            outputs: (0..config.num_outputs)
                .map(|o| Arc::new(OutputBus::new(o, block_size)))
                .collect(),
            mixer: Mutex::new(Mixer::new(&config)),
            events: EventBus::new(),
            state: AtomicU8::new(EngineState::Idle as u8),
            armed: AtomicBool::new(false),
            recovering: AtomicBool::new(false),
            faults: alarm_rx,
            control: Mutex::new(Control {
                io: IoAdapter::new(backend, &config, alarm_tx),
                scheduler: None,
            }),
            config,
        });

        Ok(Self { core })
    }

    /// Engine over every cpal host
    pub fn with_cpal(config: EngineConfig) -> AudioResult<Self> {
        Self::new(config, Arc::new(CpalBackend::new()))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.core.config
    }

    pub fn num_inputs(&self) -> usize {
        self.core.inputs.len()
    }

    pub fn num_outputs(&self) -> usize {
        self.core.outputs.len()
    }

    pub fn state(&self) -> EngineState {
        self.core.state()
    }

    /// Whether device changes currently reconfigure streams
    pub fn is_armed(&self) -> bool {
        self.core.armed.load(Ordering::Acquire)
    }

    /// Devices usable for input slots
    pub fn input_devices(&self) -> &[AudioDevice] {
        &self.core.input_devices
    }

    /// Devices usable for output buses
    pub fn output_devices(&self) -> &[AudioDevice] {
        &self.core.output_devices
    }

    /// Receive engine events from now on
    pub fn subscribe(&self) -> Receiver<EngineEvent> {
        self.core.events.subscribe()
    }

    fn input_channel(&self, slot: usize) -> AudioResult<&Arc<InputChannel>> {
        self.core.inputs.get(slot).ok_or(AudioError::InvalidSlot {
            direction: Direction::Input,
            index: slot,
            count: self.core.inputs.len(),
        })
    }

    fn output_bus(&self, slot: usize) -> AudioResult<&Arc<OutputBus>> {
        self.core.outputs.get(slot).ok_or(AudioError::InvalidSlot {
            direction: Direction::Output,
            index: slot,
            count: self.core.outputs.len(),
        })
    }

    pub fn input(&self, slot: usize) -> AudioResult<InputStatus> {
        Ok(self.input_channel(slot)?.status())
    }

    pub fn output(&self, slot: usize) -> AudioResult<OutputStatus> {
        Ok(self.output_bus(slot)?.status())
    }

    /// Latest mixed block of a bus; `None` until the first tick after start
    pub fn mixed_block(&self, bus: usize) -> AudioResult<Option<StereoBuffer>> {
        Ok(self.output_bus(bus)?.mixed_block())
    }

    /// Streams currently open
    pub fn open_stream_count(&self) -> usize {
        self.core.lock_control().io.open_count()
    }

    /// Select (or with `None` clear) the capture device of an input slot
    ///
    /// While armed this reconfigures the streams and returns the outcome.
    pub fn select_input_device(&self, slot: usize, device: Option<DeviceId>) -> AudioResult<()> {
        let input = self.input_channel(slot)?;
        let device = match device {
            Some(id) => Some(
                resolve_device(&self.core.input_devices, &id)
                    .ok_or_else(|| AudioError::DeviceNotFound(id.display_label()))?,
            ),
            None => None,
        };

        let mut control = self.core.lock_control();
        if !input.set_device(device.clone()) {
            return Ok(());
        }
        log::info!(
            "{} device: {}",
            input.slot(),
            device.as_ref().map_or("none".to_string(), |d| d.display_label())
        );
        self.core
            .events
            .publish(EngineEvent::InputDeviceSelected { slot, device });

        if self.is_armed() {
            self.core.reconfigure_locked(&mut control)
        } else {
            Ok(())
        }
    }

    /// Select (or with `None` clear) the playback device of an output bus
    pub fn select_output_device(&self, slot: usize, device: Option<DeviceId>) -> AudioResult<()> {
        let output = self.output_bus(slot)?;
        let device = match device {
            Some(id) => Some(
                resolve_device(&self.core.output_devices, &id)
                    .ok_or_else(|| AudioError::DeviceNotFound(id.display_label()))?,
            ),
            None => None,
        };

        let mut control = self.core.lock_control();
        if !output.set_device(device.clone()) {
            return Ok(());
        }
        log::info!(
            "{} device: {}",
            output.slot(),
            device.as_ref().map_or("none".to_string(), |d| d.display_label())
        );
        self.core
            .events
            .publish(EngineEvent::OutputDeviceSelected { slot, device });

        if self.is_armed() {
            self.core.reconfigure_locked(&mut control)
        } else {
            Ok(())
        }
    }

    /// Set an input's fader position (0.0 to 1.0)
    pub fn set_fader(&self, slot: usize, value: f32) -> AudioResult<()> {
        let input = self.input_channel(slot)?;
        if !(0.0..=1.0).contains(&value) {
            return Err(AudioError::InvalidParameter(format!(
                "fader must be within 0.0..=1.0, got {}",
                value
            )));
        }
        input.set_fader(value);
        Ok(())
    }

    fn set_gain(&self, slot: usize, band: Band, gain: i8) -> AudioResult<()> {
        let input = self.input_channel(slot)?;
        if !is_valid_gain(gain) {
            return Err(AudioError::InvalidParameter(format!(
                "{} gain must be within -10..=10, got {}",
                band, gain
            )));
        }
        input.set_gain(band, gain);
        Ok(())
    }

    pub fn set_bass_gain(&self, slot: usize, gain: i8) -> AudioResult<()> {
        self.set_gain(slot, Band::Bass, gain)
    }

    pub fn set_treble_gain(&self, slot: usize, gain: i8) -> AudioResult<()> {
        self.set_gain(slot, Band::Treble, gain)
    }

    pub fn set_eq_gain(&self, slot: usize, gain: i8) -> AudioResult<()> {
        self.set_gain(slot, Band::Eq, gain)
    }

    /// Route (or unroute) an input to an output bus
    pub fn set_routing(&self, input: usize, bus: usize, routed: bool) -> AudioResult<()> {
        let channel = self.input_channel(input)?;
        self.output_bus(bus)?;
        channel.set_routed(bus, routed);
        Ok(())
    }

    /// Open every configured stream and start mixing
    ///
    /// On failure the engine is back in Idle with no stream open, and stays
    /// armed so that the next device selection retries.
    pub fn start(&self) -> AudioResult<()> {
        let mut control = self.core.lock_control();
        self.core.armed.store(true, Ordering::Release);
        self.core.start_locked(&mut control)
    }

    /// Stop mixing, close every stream, zero meters and mixed blocks
    pub fn stop(&self) {
        let mut control = self.core.lock_control();
        self.core.armed.store(false, Ordering::Release);
        self.core.stop_locked(&mut control);
    }

    /// Close and reopen all streams for the current device selection
    pub fn reconfigure(&self) -> AudioResult<()> {
        let mut control = self.core.lock_control();
        self.core.reconfigure_locked(&mut control)
    }

    /// Run one mix tick now, on the calling thread
    ///
    /// Returns false (and does nothing) unless the engine is running.
    pub fn mix_now(&self) -> bool {
        if self.state() != EngineState::Running {
            return false;
        }
        self.core.tick();
        self.core.handle_faults();
        true
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{
        AudioStream, CaptureCallback, ErrorKind, PlaybackCallback, StreamRequest, VirtualBackend,
    };
    use crate::types::SlotId;
    use std::time::{Duration, Instant};

    const BLOCK: usize = 64;

    /// Small blocks, no settle delay, and a worker that never ticks on its own
    fn test_config() -> EngineConfig {
        let mut config = EngineConfig::default()
            .with_block_size(BLOCK as u32)
            .without_delays();
        config.mix_interval_ms = 60_000;
        config
    }

    fn engine(backend: &VirtualBackend) -> Engine {
        Engine::new(test_config(), Arc::new(backend.clone())).unwrap()
    }

    fn id(name: &str) -> Option<DeviceId> {
        Some(DeviceId::new(name))
    }

    fn ramp(scale: f32) -> Vec<f32> {
        (0..BLOCK * 2).map(|n| scale * (n as f32 / (BLOCK * 2) as f32 - 0.5)).collect()
    }

    fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        condition()
    }

    fn errors(rx: &Receiver<EngineEvent>) -> Vec<ErrorKind> {
        rx.try_iter()
            .filter_map(|e| match e {
                EngineEvent::Error { kind, .. } => Some(kind),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_construction_checks_devices() {
        let none = VirtualBackend::with_devices(0, 2);
        let err = Engine::new(test_config(), Arc::new(none)).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::DeviceEnumerationFailure);

        let broken = VirtualBackend::with_devices(1, 1);
        broken.break_enumeration(true);
        let err = Engine::new(test_config(), Arc::new(broken)).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::DeviceEnumerationFailure);

        let mut config = test_config();
        config.min_output_devices = 3;
        let err = Engine::new(config, Arc::new(VirtualBackend::with_devices(4, 2))).err().unwrap();
        assert!(matches!(
            err,
            AudioError::InsufficientDevices { direction: Direction::Output, found: 2, required: 3 }
        ));
    }

    #[test]
    fn test_defaults_and_device_lists() {
        let backend = VirtualBackend::with_devices(2, 3);
        backend.add_device("Mono Mic", 1, 0);
        let engine = engine(&backend);

        assert_eq!(engine.state(), EngineState::Idle);
        assert_eq!(engine.num_inputs(), 4);
        assert_eq!(engine.num_outputs(), 6);
        assert_eq!(engine.input_devices().len(), 2);
        assert_eq!(engine.output_devices().len(), 3);

        let input = engine.input(3).unwrap();
        assert_eq!(input.fader, 0.5);
        assert!(input.routing.is_empty());
        assert!(input.device.is_none());
        assert!(engine.mixed_block(5).unwrap().is_none());
    }

    #[test]
    fn test_setters_validate() {
        let engine = engine(&VirtualBackend::with_devices(1, 1));

        let kind = |r: AudioResult<()>| r.unwrap_err().kind();
        assert_eq!(kind(engine.set_fader(4, 0.5)), ErrorKind::InvalidRequest);
        assert_eq!(kind(engine.set_fader(0, 1.1)), ErrorKind::InvalidRequest);
        assert_eq!(kind(engine.set_fader(0, f32::NAN)), ErrorKind::InvalidRequest);
        assert_eq!(kind(engine.set_bass_gain(0, 11)), ErrorKind::InvalidRequest);
        assert_eq!(kind(engine.set_routing(0, 6, true)), ErrorKind::InvalidRequest);
        assert_eq!(kind(engine.select_input_device(0, id("Virtual Out 1"))), ErrorKind::InvalidRequest);

        engine.set_fader(0, 0.7).unwrap();
        engine.set_treble_gain(0, -10).unwrap();
        engine.set_eq_gain(0, 10).unwrap();
        engine.set_routing(0, 5, true).unwrap();
        engine.select_input_device(0, id("Virtual In 1")).unwrap();

        let input = engine.input(0).unwrap();
        assert_eq!(input.fader, 0.7);
        assert_eq!(input.gains.treble, -10);
        assert_eq!(input.gains.eq, 10);
        assert_eq!(input.routing, vec![5]);
        assert_eq!(input.device.unwrap().host.as_deref(), Some("Virtual"));
    }

    #[test]
    fn test_capture_mix_playback() {
        let backend = VirtualBackend::with_devices(1, 2);
        let engine = engine(&backend);
        let events = engine.subscribe();

        engine.select_input_device(0, id("Virtual In 1")).unwrap();
        engine.select_output_device(0, id("Virtual Out 1")).unwrap();
        engine.select_output_device(1, id("Virtual Out 2")).unwrap();
        assert_eq!(backend.open_stream_count(), 0);

        engine.set_fader(0, 1.0).unwrap();
        engine.set_routing(0, 0, true).unwrap();
        engine.start().unwrap();
        assert_eq!(engine.state(), EngineState::Running);
        assert_eq!(backend.open_stream_count(), 3);

        let data = ramp(1.0);
        assert!(backend.capture("Virtual In 1", &data));
        let (left, _) = engine.input(0).unwrap().meter;
        assert!(left > 0.0);

        assert!(engine.mix_now());
        assert_eq!(backend.render("Virtual Out 1", BLOCK).unwrap(), data);
        assert!(backend
            .render("Virtual Out 2", BLOCK)
            .unwrap()
            .iter()
            .all(|s| *s == 0.0));

        let states: Vec<EngineState> = events
            .try_iter()
            .filter_map(|e| match e {
                EngineEvent::StateChanged(s) => Some(s),
                _ => None,
            })
            .collect();
        assert_eq!(states, vec![EngineState::Starting, EngineState::Running]);
    }

    #[test]
    fn test_stop_zeroes_meters_and_blocks() {
        let backend = VirtualBackend::with_devices(1, 1);
        let engine = engine(&backend);
        engine.select_input_device(0, id("Virtual In 1")).unwrap();
        engine.select_output_device(0, id("Virtual Out 1")).unwrap();
        engine.set_routing(0, 0, true).unwrap();
        engine.start().unwrap();

        backend.capture("Virtual In 1", &ramp(1.0));
        engine.mix_now();
        assert!(engine.mixed_block(0).unwrap().is_some());

        engine.stop();
        assert_eq!(engine.state(), EngineState::Idle);
        assert!(!engine.is_armed());
        assert_eq!(backend.open_stream_count(), 0);
        assert_eq!(engine.input(0).unwrap().meter, (0.0, 0.0));
        assert_eq!(engine.output(0).unwrap().meter, (0.0, 0.0));
        assert!(engine.mixed_block(0).unwrap().is_none());
        assert!(!engine.mix_now());

        // Device selection is kept for the next start
        assert!(engine.input(0).unwrap().device.is_some());
    }

    #[test]
    fn test_open_failure_rolls_back_and_retry_succeeds() {
        let backend = VirtualBackend::with_devices(2, 4);
        let engine = engine(&backend);
        let events = engine.subscribe();

        engine.select_input_device(0, id("Virtual In 1")).unwrap();
        for bus in 0..3 {
            engine
                .select_output_device(bus, id(&format!("Virtual Out {}", bus + 1)))
                .unwrap();
        }
        engine.set_fader(0, 1.0).unwrap();
        engine.set_routing(0, 0, true).unwrap();
        backend.fail_opens("Virtual Out 3", true);

        let err = engine.start().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StreamOpenFailure);
        assert!(err.to_string().contains("output 3"));
        assert_eq!(engine.state(), EngineState::Idle);
        assert_eq!(backend.open_stream_count(), 0);
        assert!(errors(&events).contains(&ErrorKind::StreamOpenFailure));
        assert!(engine.is_armed());

        // Picking another device for bus 3 is the retry
        engine.select_output_device(2, id("Virtual Out 4")).unwrap();
        assert_eq!(engine.state(), EngineState::Running);
        assert_eq!(
            backend.open_devices(Direction::Output),
            vec!["Virtual Out 1", "Virtual Out 2", "Virtual Out 4"]
        );

        let data = ramp(0.5);
        backend.capture("Virtual In 1", &data);
        engine.mix_now();
        assert_eq!(backend.render("Virtual Out 1", BLOCK).unwrap(), data);
    }

    #[test]
    fn test_rapid_reconfigure_leaves_no_stale_streams() {
        let backend = VirtualBackend::with_devices(4, 2);
        let engine = engine(&backend);
        engine.select_output_device(0, id("Virtual Out 1")).unwrap();
        engine.start().unwrap();

        for i in 0..20 {
            let a = format!("Virtual In {}", 1 + i % 2);
            let b = format!("Virtual In {}", 3 + (i / 3) % 2);
            engine.select_input_device(0, id(&a)).unwrap();
            engine.select_input_device(1, id(&b)).unwrap();
            if i % 5 == 0 {
                engine.select_output_device(0, id(&format!("Virtual Out {}", 1 + i % 2))).unwrap();
            }
            engine.reconfigure().unwrap();
        }

        // Last iteration (i = 19) selects In 2 and In 3; Out 2 was set at i = 15
        assert_eq!(engine.state(), EngineState::Running);
        assert_eq!(backend.open_devices(Direction::Input), vec!["Virtual In 2", "Virtual In 3"]);
        assert_eq!(backend.open_devices(Direction::Output), vec!["Virtual Out 2"]);
        assert_eq!(engine.open_stream_count(), 3);
    }

    #[test]
    fn test_rapid_reconfigure_from_many_threads() {
        let backend = VirtualBackend::with_devices(2, 1);
        let engine = Arc::new(engine(&backend));
        engine.select_output_device(0, id("Virtual Out 1")).unwrap();
        engine.start().unwrap();

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let engine = engine.clone();
                thread::spawn(move || {
                    for i in 0..10 {
                        let name = format!("Virtual In {}", 1 + (t + i) % 2);
                        let _ = engine.select_input_device(0, id(&name));
                        let _ = engine.reconfigure();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let selected = engine.input(0).unwrap().device.unwrap().name;
        assert_eq!(backend.open_devices(Direction::Input), vec![selected]);
        assert_eq!(backend.open_stream_count(), 2);
    }

    #[test]
    fn test_selection_while_idle_opens_nothing() {
        let backend = VirtualBackend::with_devices(1, 1);
        let engine = engine(&backend);
        engine.select_input_device(0, id("Virtual In 1")).unwrap();
        engine.reconfigure().unwrap();
        assert_eq!(backend.open_stream_count(), 0);
        assert_eq!(engine.state(), EngineState::Idle);
    }

    #[test]
    fn test_repeated_faults_reopen_streams() {
        let backend = VirtualBackend::with_devices(1, 1);
        let mut config = test_config();
        config.fault_threshold = 2;
        let engine = Engine::new(config, Arc::new(backend.clone())).unwrap();
        let events = engine.subscribe();

        engine.select_input_device(0, id("Virtual In 1")).unwrap();
        engine.select_output_device(0, id("Virtual Out 1")).unwrap();
        engine.start().unwrap();
        let opened = backend.total_opened();

        backend.inject_fault(Direction::Output, "Virtual Out 1", "underrun");
        engine.mix_now();
        assert_eq!(errors(&events), vec![ErrorKind::CallbackFault]);

        backend.inject_fault(Direction::Output, "Virtual Out 1", "underrun");
        engine.mix_now();
        assert!(wait_for(Duration::from_secs(5), || backend.total_opened() == opened + 2));
        assert!(wait_for(Duration::from_secs(5), || !engine.core.recovering.load(Ordering::Acquire)));

        let kinds = errors(&events);
        assert!(kinds.contains(&ErrorKind::CallbackFault));
        assert!(kinds.contains(&ErrorKind::StreamOpenFailure));
        assert_eq!(engine.state(), EngineState::Running);
        assert_eq!(backend.open_stream_count(), 2);
    }

    #[test]
    fn test_worker_mixes_on_its_own() {
        let backend = VirtualBackend::with_devices(1, 1);
        let mut config = test_config();
        config.mix_interval_ms = 5;
        let engine = Engine::new(config, Arc::new(backend.clone())).unwrap();
        engine.select_input_device(0, id("Virtual In 1")).unwrap();
        engine.set_routing(0, 0, true).unwrap();
        engine.start().unwrap();

        backend.capture("Virtual In 1", &ramp(1.0));
        assert!(wait_for(Duration::from_secs(5), || {
            engine.mixed_block(0).unwrap().is_some_and(|b| !b.is_silent())
        }));

        engine.stop();
        assert!(engine.mixed_block(0).unwrap().is_none());
    }

    #[test]
    fn test_resolve_device_by_name() {
        let backend = VirtualBackend::with_devices(1, 0);
        let devices = backend.devices().unwrap();
        let canonical = resolve_device(&devices, &DeviceId::new("Virtual In 1")).unwrap();
        assert_eq!(canonical, DeviceId::with_host("Virtual In 1", "Virtual"));
        assert!(resolve_device(&devices, &DeviceId::with_host("Virtual In 1", "ALSA")).is_none());
    }

    /// Opens as many streams per device as asked, like most platform hosts
    #[derive(Default)]
    struct SharingBackend {
        open: Arc<std::sync::atomic::AtomicUsize>,
    }

    struct SharedStream {
        slot: SlotId,
        device: DeviceId,
        open: Arc<std::sync::atomic::AtomicUsize>,
    }

    impl AudioStream for SharedStream {
        fn slot(&self) -> SlotId {
            self.slot
        }

        fn device(&self) -> &DeviceId {
            &self.device
        }

        fn close(self: Box<Self>, _timeout: Duration) {}
    }

    impl Drop for SharedStream {
        fn drop(&mut self) {
            self.open.fetch_sub(1, Ordering::SeqCst);
        }
    }

    impl SharingBackend {
        fn stream(&self, request: StreamRequest) -> AudioResult<Box<dyn AudioStream>> {
            self.open.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(SharedStream {
                slot: request.slot,
                device: request.device,
                open: self.open.clone(),
            }))
        }
    }

    impl AudioBackend for SharingBackend {
        fn name(&self) -> &'static str {
            "sharing"
        }

        fn devices(&self) -> AudioResult<Vec<AudioDevice>> {
            let device = |name: &str, inputs, outputs| AudioDevice {
                id: DeviceId::with_host(name, "Test"),
                name: name.to_string(),
                host: "Test".to_string(),
                max_input_channels: inputs,
                max_output_channels: outputs,
            };
            Ok(vec![device("Mic", 2, 0), device("Speakers", 0, 2)])
        }

        fn open_input(
            &self,
            request: StreamRequest,
            _callback: CaptureCallback,
        ) -> AudioResult<Box<dyn AudioStream>> {
            self.stream(request)
        }

        fn open_output(
            &self,
            request: StreamRequest,
            _callback: PlaybackCallback,
        ) -> AudioResult<Box<dyn AudioStream>> {
            self.stream(request)
        }
    }

    #[test]
    fn test_one_stream_per_device_without_backend_help() {
        let backend = Arc::new(SharingBackend::default());
        let open = backend.open.clone();
        let engine = Engine::new(test_config(), backend).unwrap();
        let events = engine.subscribe();

        engine.select_input_device(0, id("Mic")).unwrap();
        engine.select_input_device(1, id("Mic")).unwrap();
        engine.select_output_device(0, id("Speakers")).unwrap();

        let err = engine.start().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StreamOpenFailure);
        assert!(err.to_string().contains("input 2"));
        assert_eq!(engine.state(), EngineState::Idle);
        assert_eq!(engine.open_stream_count(), 0);
        assert_eq!(open.load(Ordering::SeqCst), 0);
        assert!(errors(&events).contains(&ErrorKind::StreamOpenFailure));

        // Moving the second input off the shared device is the retry
        engine.select_input_device(1, None).unwrap();
        assert_eq!(engine.state(), EngineState::Running);
        assert_eq!(open.load(Ordering::SeqCst), 2);
    }
}
