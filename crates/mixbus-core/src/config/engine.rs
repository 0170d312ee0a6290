//! Engine configuration
//!
//! Everything here is fixed for the lifetime of an [`Engine`](crate::engine::Engine):
//! slot counts, the shared stream format and the timing of the mix worker and
//! of reconfiguration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::audio::{AudioError, AudioResult};
use crate::dsp::TREBLE_CUTOFF_HZ;
use crate::types::{
    DEFAULT_BLOCK_SIZE, DEFAULT_NUM_INPUTS, DEFAULT_NUM_OUTPUTS, DEFAULT_SAMPLE_RATE, MAX_OUTPUTS,
};

/// Smallest accepted block size in frames
pub const MIN_BLOCK_SIZE: u32 = 16;

/// Largest accepted block size in frames
pub const MAX_BLOCK_SIZE: u32 = 16384;

/// How filter history is handled between consecutive captured blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterMemory {
    /// Every block is filtered from zero history
    #[default]
    PerBlock,
    /// History carries over from one captured block to the next
    Continuous,
}

/// How a bus accumulator is normalized by the summed input levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusNormalization {
    /// Divide by `max(total level, 1)`: a lone input follows its fader,
    /// several loud inputs are averaged
    #[default]
    ClampedAverage,
    /// Divide by the total level whenever it is non-zero
    Average,
}

/// Configuration for the mixing engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of input slots
    pub num_inputs: usize,
    /// Number of output buses (at most 32)
    pub num_outputs: usize,
    /// Sample rate shared by every stream
    pub sample_rate: u32,
    /// Frames per captured/mixed block
    pub block_size: u32,
    /// Period of the mix worker
    pub mix_interval_ms: u64,
    /// Upper bound on opening one stream
    pub open_timeout_ms: u64,
    /// Upper bound on waiting for in-flight callbacks after teardown
    pub drain_timeout_ms: u64,
    /// Pause between teardown and reopen during reconfiguration
    pub settle_delay_ms: u64,
    /// Callback faults on one stream before it is treated as failed
    pub fault_threshold: u32,
    pub filter_memory: FilterMemory,
    pub bus_normalization: BusNormalization,
    /// Initial fader position of every input (0.0 to 1.0)
    pub default_fader: f32,
    /// Compatible input devices required at construction
    pub min_input_devices: usize,
    /// Compatible output devices required at construction
    pub min_output_devices: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            num_inputs: DEFAULT_NUM_INPUTS,
            num_outputs: DEFAULT_NUM_OUTPUTS,
            sample_rate: DEFAULT_SAMPLE_RATE,
            block_size: DEFAULT_BLOCK_SIZE,
            mix_interval_ms: 20,
            open_timeout_ms: 2000,
            drain_timeout_ms: 500,
            settle_delay_ms: 300,
            fault_threshold: 8,
            filter_memory: FilterMemory::default(),
            bus_normalization: BusNormalization::default(),
            default_fader: 0.5,
            min_input_devices: 1,
            min_output_devices: 1,
        }
    }
}

impl EngineConfig {
    /// Check every field against its accepted range
    pub fn validate(&self) -> AudioResult<()> {
        if self.num_inputs == 0 {
            return Err(AudioError::InvalidConfig("num_inputs must be at least 1".into()));
        }
        if self.num_outputs == 0 || self.num_outputs > MAX_OUTPUTS {
            return Err(AudioError::InvalidConfig(format!(
                "num_outputs must be between 1 and {}, got {}",
                MAX_OUTPUTS, self.num_outputs
            )));
        }
        if self.nyquist() <= TREBLE_CUTOFF_HZ {
            return Err(AudioError::InvalidConfig(format!(
                "sample_rate must exceed {} Hz for the treble band, got {}",
                2.0 * TREBLE_CUTOFF_HZ,
                self.sample_rate
            )));
        }
        if !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&self.block_size) {
            return Err(AudioError::InvalidConfig(format!(
                "block_size must be between {} and {}, got {}",
                MIN_BLOCK_SIZE, MAX_BLOCK_SIZE, self.block_size
            )));
        }
        if self.mix_interval_ms == 0 {
            return Err(AudioError::InvalidConfig("mix_interval_ms must be positive".into()));
        }
        if self.open_timeout_ms == 0 {
            return Err(AudioError::InvalidConfig("open_timeout_ms must be positive".into()));
        }
        if self.fault_threshold == 0 {
            return Err(AudioError::InvalidConfig("fault_threshold must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.default_fader) {
            return Err(AudioError::InvalidConfig(format!(
                "default_fader must be within 0.0..=1.0, got {}",
                self.default_fader
            )));
        }
        Ok(())
    }

    /// Half the sample rate
    pub fn nyquist(&self) -> f32 {
        self.sample_rate as f32 / 2.0
    }

    pub fn mix_interval(&self) -> Duration {
        Duration::from_millis(self.mix_interval_ms)
    }

    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    /// Block duration in milliseconds at the configured rate
    pub fn block_latency_ms(&self) -> f32 {
        (self.block_size as f32 / self.sample_rate as f32) * 1000.0
    }

    pub fn with_slots(mut self, num_inputs: usize, num_outputs: usize) -> Self {
        self.num_inputs = num_inputs;
        self.num_outputs = num_outputs;
        self
    }

    pub fn with_block_size(mut self, frames: u32) -> Self {
        self.block_size = frames;
        self
    }

    pub fn with_sample_rate(mut self, rate: u32) -> Self {
        self.sample_rate = rate;
        self
    }

    pub fn with_filter_memory(mut self, memory: FilterMemory) -> Self {
        self.filter_memory = memory;
        self
    }

    pub fn with_bus_normalization(mut self, normalization: BusNormalization) -> Self {
        self.bus_normalization = normalization;
        self
    }

    /// Zero settle delay and short timeouts (tests and offline use)
    pub fn without_delays(mut self) -> Self {
        self.settle_delay_ms = 0;
        self.drain_timeout_ms = 50;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.num_inputs, 4);
        assert_eq!(config.num_outputs, 6);
        assert_eq!(config.mix_interval(), Duration::from_millis(20));
        assert!((config.block_latency_ms() - 85.333).abs() < 0.01);
    }

    #[test]
    fn test_validate_rejects_out_of_range() {
        assert!(EngineConfig::default().with_slots(0, 6).validate().is_err());
        assert!(EngineConfig::default().with_slots(4, 33).validate().is_err());
        assert!(EngineConfig::default().with_block_size(8).validate().is_err());
        assert!(EngineConfig::default().with_sample_rate(0).validate().is_err());
        assert!(EngineConfig::default().with_sample_rate(8000).validate().is_err());
        assert!(EngineConfig::default().with_sample_rate(44100).validate().is_ok());

        let config = EngineConfig {
            default_fader: 1.5,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(AudioError::InvalidConfig(_))));
    }

    #[test]
    fn test_yaml_uses_snake_case_enums_and_defaults() {
        let yaml = "num_inputs: 2\nfilter_memory: continuous\nbus_normalization: average\n";
        let config: EngineConfig = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(config.num_inputs, 2);
        assert_eq!(config.num_outputs, 6);
        assert_eq!(config.filter_memory, FilterMemory::Continuous);
        assert_eq!(config.bus_normalization, BusNormalization::Average);
    }
}
