//! Per-slot state shared by the controller, the mix worker and the callbacks
//!
//! Scalar parameters are atomics so the UI side can set them without ever
//! contending with audio. Blocks live in [`BlockCell`]s. The selected device
//! is behind a plain mutex since only the controller touches it.

use std::sync::atomic::{AtomicI8, AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};

use super::cell::BlockCell;
use crate::audio::DeviceId;
use crate::dsp::{Band, ToneGains};
use crate::types::{SlotId, StereoBuffer};

/// Left/right RMS meter stored as f32 bits
#[derive(Debug, Default)]
pub struct LevelMeter {
    left: AtomicU32,
    right: AtomicU32,
}

impl LevelMeter {
    #[inline]
    pub fn store(&self, left: f32, right: f32) {
        self.left.store(left.to_bits(), Ordering::Relaxed);
        self.right.store(right.to_bits(), Ordering::Relaxed);
    }

    pub fn load(&self) -> (f32, f32) {
        (
            f32::from_bits(self.left.load(Ordering::Relaxed)),
            f32::from_bits(self.right.load(Ordering::Relaxed)),
        )
    }

    pub fn reset(&self) {
        self.store(0.0, 0.0);
    }
}

/// Routing mask bit of a bus, `None` past the 32nd
#[inline]
fn bus_bit(bus: usize) -> Option<u32> {
    u32::try_from(bus).ok().and_then(|b| 1u32.checked_shl(b))
}

/// One input slot
pub struct InputChannel {
    slot: SlotId,
    device: Mutex<Option<DeviceId>>,
    /// Latest captured block
    pub(crate) captured: BlockCell,
    fader: AtomicU32,
    bass: AtomicI8,
    treble: AtomicI8,
    eq: AtomicI8,
    /// Bit `o` set when routed to output bus `o`
    routing: AtomicU32,
    pub(crate) meter: LevelMeter,
}

impl InputChannel {
    pub fn new(index: usize, block_size: usize, fader: f32) -> Self {
        Self {
            slot: SlotId::input(index),
            device: Mutex::new(None),
            captured: BlockCell::new(block_size),
            fader: AtomicU32::new(fader.to_bits()),
            bass: AtomicI8::new(0),
            treble: AtomicI8::new(0),
            eq: AtomicI8::new(0),
            routing: AtomicU32::new(0),
            meter: LevelMeter::default(),
        }
    }

    pub fn slot(&self) -> SlotId {
        self.slot
    }

    fn device_lock(&self) -> MutexGuard<'_, Option<DeviceId>> {
        self.device.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn device(&self) -> Option<DeviceId> {
        self.device_lock().clone()
    }

    /// Replace the device, returning whether it changed
    pub(crate) fn set_device(&self, device: Option<DeviceId>) -> bool {
        let mut current = self.device_lock();
        if *current == device {
            return false;
        }
        *current = device;
        true
    }

    pub fn fader(&self) -> f32 {
        f32::from_bits(self.fader.load(Ordering::Relaxed))
    }

    pub(crate) fn set_fader(&self, value: f32) {
        self.fader.store(value.to_bits(), Ordering::Relaxed);
    }

    pub fn gains(&self) -> ToneGains {
        ToneGains {
            bass: self.bass.load(Ordering::Relaxed),
            treble: self.treble.load(Ordering::Relaxed),
            eq: self.eq.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn set_gain(&self, band: Band, gain: i8) {
        let target = match band {
            Band::Bass => &self.bass,
            Band::Treble => &self.treble,
            Band::Eq => &self.eq,
        };
        target.store(gain, Ordering::Relaxed);
    }

    pub fn routing_mask(&self) -> u32 {
        self.routing.load(Ordering::Relaxed)
    }

    /// False for any bus beyond the 32 a mask can hold
    #[inline]
    pub fn is_routed(&self, bus: usize) -> bool {
        bus_bit(bus).is_some_and(|bit| self.routing_mask() & bit != 0)
    }

    /// Ignored for a bus beyond the 32 a mask can hold
    pub(crate) fn set_routed(&self, bus: usize, on: bool) {
        let Some(bit) = bus_bit(bus) else { return };
        if on {
            self.routing.fetch_or(bit, Ordering::Relaxed);
        } else {
            self.routing.fetch_and(!bit, Ordering::Relaxed);
        }
    }

    /// Left/right RMS of the most recent capture callback
    pub fn meter(&self) -> (f32, f32) {
        self.meter.load()
    }

    /// Read-side copy for the UI
    pub fn status(&self) -> InputStatus {
        let mask = self.routing_mask();
        InputStatus {
            slot: self.slot,
            device: self.device(),
            fader: self.fader(),
            gains: self.gains(),
            routing: (0..32usize).filter(|&bus| mask & (1u32 << bus) != 0).collect(),
            meter: self.meter(),
            capturing: !self.captured.is_empty(),
        }
    }
}

/// One output bus
pub struct OutputBus {
    slot: SlotId,
    device: Mutex<Option<DeviceId>>,
    /// Latest mixed block
    pub(crate) mixed: BlockCell,
    pub(crate) meter: LevelMeter,
}

impl OutputBus {
    pub fn new(index: usize, block_size: usize) -> Self {
        Self {
            slot: SlotId::output(index),
            device: Mutex::new(None),
            mixed: BlockCell::new(block_size),
            meter: LevelMeter::default(),
        }
    }

    pub fn slot(&self) -> SlotId {
        self.slot
    }

    fn device_lock(&self) -> MutexGuard<'_, Option<DeviceId>> {
        self.device.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn device(&self) -> Option<DeviceId> {
        self.device_lock().clone()
    }

    pub(crate) fn set_device(&self, device: Option<DeviceId>) -> bool {
        let mut current = self.device_lock();
        if *current == device {
            return false;
        }
        *current = device;
        true
    }

    /// Copy of the latest mixed block, if one was produced since start
    pub fn mixed_block(&self) -> Option<StereoBuffer> {
        self.mixed.snapshot()
    }

    /// Left/right RMS of the latest mixed block
    pub fn meter(&self) -> (f32, f32) {
        self.meter.load()
    }

    pub fn status(&self) -> OutputStatus {
        OutputStatus {
            slot: self.slot,
            device: self.device(),
            meter: self.meter(),
            mixed_blocks: self.mixed.sequence(),
        }
    }
}

/// Snapshot of an input slot
#[derive(Debug, Clone, PartialEq)]
pub struct InputStatus {
    pub slot: SlotId,
    pub device: Option<DeviceId>,
    pub fader: f32,
    pub gains: ToneGains,
    /// Output bus indices this input is routed to, ascending
    pub routing: Vec<usize>,
    pub meter: (f32, f32),
    /// Whether at least one block was captured since start
    pub capturing: bool,
}

/// Snapshot of an output bus
#[derive(Debug, Clone, PartialEq)]
pub struct OutputStatus {
    pub slot: SlotId,
    pub device: Option<DeviceId>,
    pub meter: (f32, f32),
    /// Blocks mixed into this bus since start
    pub mixed_blocks: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_input_defaults() {
        let input = InputChannel::new(1, 16, 0.5);
        let status = input.status();
        assert_eq!(status.slot, SlotId::input(1));
        assert_eq!(status.device, None);
        assert_eq!(status.fader, 0.5);
        assert!(status.gains.is_flat());
        assert!(status.routing.is_empty());
        assert_eq!(status.meter, (0.0, 0.0));
        assert!(!status.capturing);
    }

    #[test]
    fn test_routing_bits() {
        let input = InputChannel::new(0, 16, 0.5);
        input.set_routed(4, true);
        input.set_routed(0, true);
        input.set_routed(31, true);
        assert!(input.is_routed(4));
        assert_eq!(input.status().routing, vec![0, 4, 31]);

        input.set_routed(4, false);
        assert!(!input.is_routed(4));
        assert_eq!(input.routing_mask(), 1 | (1 << 31));
    }

    #[test]
    fn test_routing_ignores_buses_past_mask() {
        let input = InputChannel::new(0, 16, 0.5);
        input.set_routed(32, true);
        input.set_routed(usize::MAX, true);
        assert_eq!(input.routing_mask(), 0);
        assert!(!input.is_routed(32));
        assert!(!input.is_routed(200));

        input.set_routed(31, true);
        input.set_routed(40, false);
        assert_eq!(input.routing_mask(), 1 << 31);
    }

    #[test]
    fn test_set_device_reports_change() {
        let bus = OutputBus::new(2, 16);
        let id = DeviceId::new("Speakers");
        assert!(bus.set_device(Some(id.clone())));
        assert!(!bus.set_device(Some(id.clone())));
        assert_eq!(bus.device(), Some(id));
        assert!(bus.set_device(None));
    }

    #[test]
    fn test_gains_and_meter() {
        let input = InputChannel::new(0, 16, 0.5);
        input.set_gain(Band::Treble, -7);
        input.set_gain(Band::Eq, 3);
        assert_eq!(input.gains(), ToneGains::new(0, -7, 3));

        input.meter.store(0.25, 0.5);
        assert_eq!(input.meter(), (0.25, 0.5));
        input.meter.reset();
        assert_eq!(input.meter(), (0.0, 0.0));
    }
}
