//! Routing matrix and bus mixer
//!
//! Each tick pulls the latest captured block of every input, runs it through
//! that input's tone filters, and sums it into every bus the input is routed
//! to, scaled by the fader level:
//!
//! ```text
//! level_i   = fader_i^4
//! bus_o     = sum(filtered_i * level_i  for i routed to o) / norm(sum(level_i))
//! ```
//!
//! Filtering is per input and independent, so it runs on the rayon pool.
//! Summing is cheap and stays on the calling thread.

use std::sync::Arc;

use rayon::prelude::*;

use super::channel::InputChannel;
use crate::config::{BusNormalization, EngineConfig};
use crate::dsp::{FilterBank, ToneGains};
use crate::types::StereoBuffer;

/// Fader position (0.0 to 1.0) to linear level
///
/// Quartic taper: 0.5 is about -24 dB, 0.7 about -12 dB.
#[inline]
pub fn fader_to_level(fader: f32) -> f32 {
    let f = fader.clamp(0.0, 1.0);
    let sq = f * f;
    sq * sq
}

/// Parameters of one input as read at the start of a tick
#[derive(Debug, Clone, Copy, Default)]
struct TickParams {
    level: f32,
    mask: u32,
    gains: ToneGains,
}

/// Per-input working state of the mixer
struct InputLane {
    bank: FilterBank,
    snapshot: StereoBuffer,
    params: TickParams,
}

impl InputLane {
    /// Snapshot the input and refresh its filtered block
    fn pull(&mut self, input: &InputChannel) {
        self.params = TickParams {
            level: fader_to_level(input.fader()),
            mask: input.routing_mask(),
            gains: input.gains(),
        };
        if self.params.mask == 0 {
            return;
        }
        let sequence = input.captured.snapshot_into(&mut self.snapshot);
        self.bank.process(&self.snapshot, sequence, self.params.gains);
    }

    fn filtered(&self) -> &StereoBuffer {
        self.bank.output()
    }
}

/// Mixes every input into every bus
pub struct Mixer {
    normalization: BusNormalization,
    lanes: Vec<InputLane>,
    buses: Vec<StereoBuffer>,
}

impl Mixer {
    pub fn new(config: &EngineConfig) -> Self {
        let block_size = config.block_size as usize;
        let lanes = (0..config.num_inputs)
            .map(|_| InputLane {
                bank: FilterBank::new(config.sample_rate, block_size, config.filter_memory),
                snapshot: StereoBuffer::silence(block_size),
                params: TickParams::default(),
            })
            .collect();
        Self {
            normalization: config.bus_normalization,
            lanes,
            buses: vec![StereoBuffer::silence(block_size); config.num_outputs],
        }
    }

    pub fn num_buses(&self) -> usize {
        self.buses.len()
    }

    /// Drop filter history and cached output
    pub fn reset(&mut self) {
        for lane in &mut self.lanes {
            lane.bank.reset();
        }
        for bus in &mut self.buses {
            bus.fill_silence();
        }
    }

    /// Mix one tick; returns one block per bus
    pub fn mix_tick(&mut self, inputs: &[Arc<InputChannel>]) -> &[StereoBuffer] {
        debug_assert_eq!(inputs.len(), self.lanes.len());

        self.lanes
            .par_iter_mut()
            .zip(inputs.par_iter())
            .for_each(|(lane, input)| lane.pull(input));

        for (o, bus) in self.buses.iter_mut().enumerate() {
            bus.fill_silence();
            let mut weight = 0.0f32;

            for lane in &self.lanes {
                if lane.params.mask & (1u32 << o) == 0 {
                    continue;
                }
                if lane.params.level > 0.0 {
                    bus.add_scaled(lane.filtered(), lane.params.level);
                }
                weight += lane.params.level;
            }

            let divisor = match self.normalization {
                BusNormalization::ClampedAverage => weight.max(1.0),
                BusNormalization::Average if weight > 0.0 => weight,
                BusNormalization::Average => 1.0,
            };
            if divisor != 1.0 {
                bus.scale(1.0 / divisor);
            }
        }

        &self.buses
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FilterMemory;
    use crate::dsp::Band;
    use crate::types::StereoSample;

    const BLOCK: usize = 64;

    fn config(inputs: usize, outputs: usize) -> EngineConfig {
        EngineConfig::default()
            .with_slots(inputs, outputs)
            .with_block_size(BLOCK as u32)
    }

    fn channels(n: usize) -> Vec<Arc<InputChannel>> {
        (0..n).map(|i| Arc::new(InputChannel::new(i, BLOCK, 0.5))).collect()
    }

    fn ramp(scale: f32) -> StereoBuffer {
        let samples = (0..BLOCK)
            .map(|n| {
                let v = scale * ((n as f32 / BLOCK as f32) - 0.5);
                StereoSample::new(v, -v)
            })
            .collect();
        StereoBuffer::from_vec(samples)
    }

    #[test]
    fn test_fader_taper() {
        assert_eq!(fader_to_level(0.0), 0.0);
        assert_eq!(fader_to_level(1.0), 1.0);
        assert_eq!(fader_to_level(0.5), 0.0625);
        assert!((fader_to_level(0.7) - 0.2401).abs() < 1e-6);

        let mut prev = -1.0;
        for step in 0..=100 {
            let level = fader_to_level(step as f32 / 100.0);
            assert!(level >= prev);
            prev = level;
        }
        assert_eq!(fader_to_level(1.5), 1.0);
    }

    #[test]
    fn test_unrouted_and_silent_buses_are_zero() {
        let inputs = channels(2);
        inputs[0].captured.store(&ramp(1.0));
        inputs[1].captured.store(&ramp(0.5));
        inputs[1].set_routed(1, true);
        inputs[1].set_fader(0.0);

        let mut mixer = Mixer::new(&config(2, 3));
        let buses = mixer.mix_tick(&inputs);
        assert_eq!(buses.len(), 3);
        assert!(buses.iter().all(|b| b.is_silent()));
    }

    #[test]
    fn test_single_input_at_unity_is_exact() {
        let inputs = channels(4);
        let block = ramp(0.8);
        inputs[2].captured.store(&block);
        inputs[2].set_fader(1.0);
        inputs[2].set_routed(0, true);

        let mut mixer = Mixer::new(&config(4, 2));
        let buses = mixer.mix_tick(&inputs);
        assert_eq!(buses[0], block);
        assert!(buses[1].is_silent());
    }

    #[test]
    fn test_identical_inputs_average_to_one() {
        let inputs = channels(2);
        let block = ramp(0.9);
        for input in &inputs {
            input.captured.store(&block);
            input.set_fader(1.0);
            input.set_routed(0, true);
        }

        let mut mixer = Mixer::new(&config(2, 1));
        assert_eq!(mixer.mix_tick(&inputs)[0], block);
    }

    #[test]
    fn test_single_input_follows_fader() {
        // Four inputs, only input 2 routed to bus 5 at fader 0.7
        let inputs = channels(4);
        for (i, input) in inputs.iter().enumerate() {
            input.captured.store(&ramp(i as f32 + 1.0));
        }
        inputs[1].set_fader(0.7);
        inputs[1].set_routed(4, true);

        let mut mixer = Mixer::new(&config(4, 6));
        let buses = mixer.mix_tick(&inputs).to_vec();

        let level = 0.7f32.powi(4);
        let source = ramp(2.0);
        for (mixed, raw) in buses[4].iter().zip(source.iter()) {
            assert!((mixed.left - raw.left * level).abs() < 1e-6);
            assert!((mixed.right - raw.right * level).abs() < 1e-6);
        }
        for (o, bus) in buses.iter().enumerate() {
            if o != 4 {
                assert!(bus.is_silent(), "bus {} not silent", o);
            }
        }
    }

    #[test]
    fn test_plain_average_cancels_lone_fader() {
        let inputs = channels(1);
        let block = ramp(1.0);
        inputs[0].captured.store(&block);
        inputs[0].set_fader(0.5);
        inputs[0].set_routed(0, true);

        let cfg = config(1, 1).with_bus_normalization(BusNormalization::Average);
        let mut mixer = Mixer::new(&cfg);
        let bus = &mixer.mix_tick(&inputs)[0];
        for (mixed, raw) in bus.iter().zip(block.iter()) {
            assert!((mixed.left - raw.left).abs() < 1e-6);
        }
    }

    #[test]
    fn test_loud_inputs_are_averaged() {
        let inputs = channels(3);
        for input in &inputs {
            input.captured.store(&ramp(1.0));
            input.set_fader(1.0);
            input.set_routed(0, true);
        }
        inputs[2].captured.store(&StereoBuffer::silence(BLOCK));

        let mut mixer = Mixer::new(&config(3, 1));
        let bus = &mixer.mix_tick(&inputs)[0];
        let expected = ramp(1.0);
        for (mixed, raw) in bus.iter().zip(expected.iter()) {
            assert!((mixed.left - raw.left * 2.0 / 3.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_quiet_inputs_sum_below_unity_weight() {
        let inputs = channels(2);
        let block = ramp(1.0);
        for input in &inputs {
            input.captured.store(&block);
            input.set_fader(0.7);
            input.set_routed(0, true);
        }

        // Total level 2 x 0.7^4 stays under 1, so nothing is divided out
        let mut mixer = Mixer::new(&config(2, 1));
        let bus = &mixer.mix_tick(&inputs)[0];
        let weight = 2.0 * fader_to_level(0.7);
        assert!((weight - 0.4802).abs() < 1e-6);
        for (mixed, raw) in bus.iter().zip(block.iter()) {
            assert!((mixed.left - raw.left * weight).abs() < 1e-6);
            assert!((mixed.right - raw.right * weight).abs() < 1e-6);
        }

        let cfg = config(2, 1).with_bus_normalization(BusNormalization::Average);
        let mut mixer = Mixer::new(&cfg);
        let bus = &mixer.mix_tick(&inputs)[0];
        for (mixed, raw) in bus.iter().zip(block.iter()) {
            assert!((mixed.left - raw.left).abs() < 1e-5);
        }
    }

    #[test]
    fn test_gains_shape_routed_input() {
        let inputs = channels(1);
        let block = ramp(1.0);
        inputs[0].captured.store(&block);
        inputs[0].set_fader(1.0);
        inputs[0].set_routed(0, true);
        inputs[0].set_gain(Band::Bass, 10);

        let mut mixer = Mixer::new(&config(1, 1));
        let mixed = mixer.mix_tick(&inputs)[0].clone();

        let mut expected = block.clone();
        crate::dsp::apply_bass(&mut expected, 10, 48000);
        assert_eq!(mixed, expected);
        assert_ne!(mixed, block);
    }

    #[test]
    fn test_continuous_filter_memory_carries_history() {
        let inputs = channels(1);
        let block = ramp(1.0);
        inputs[0].set_fader(1.0);
        inputs[0].set_routed(0, true);
        inputs[0].set_gain(Band::Bass, 10);

        let cfg = config(1, 1).with_filter_memory(FilterMemory::Continuous);
        let mut mixer = Mixer::new(&cfg);

        inputs[0].captured.store(&block);
        let first = mixer.mix_tick(&inputs)[0].clone();
        let mut fresh = block.clone();
        crate::dsp::apply_bass(&mut fresh, 10, 48000);
        assert_eq!(first, fresh);

        // Same samples again: the filters start from the previous block's tail
        inputs[0].captured.store(&block);
        let second = mixer.mix_tick(&inputs)[0].clone();
        assert_ne!(second, first);
    }
}
