//! Three-band tone filter bank
//!
//! Each band adds a scaled copy of its filtered signal to the dry signal:
//!
//! ```text
//! out = x + (gain / 10) * band(x)        gain in -10..=10
//! ```
//!
//! Bands run in a fixed chain: bass (low-pass 200 Hz), treble (high-pass
//! 4 kHz), eq (band-pass 500 Hz to 2 kHz). A band with gain 0 is skipped
//! entirely, so an input with all gains at 0 passes through bit-exact.

use crate::config::FilterMemory;
use crate::types::StereoBuffer;

use super::biquad::{ButterworthKind, SosFilter, SosState};

/// Bass band low-pass cutoff
pub const BASS_CUTOFF_HZ: f32 = 200.0;

/// Treble band high-pass cutoff
pub const TREBLE_CUTOFF_HZ: f32 = 4000.0;

/// EQ band lower edge
pub const EQ_LOW_HZ: f32 = 500.0;

/// EQ band upper edge
pub const EQ_HIGH_HZ: f32 = 2000.0;

/// Gain bounds shared by every band
pub const MIN_GAIN: i8 = -10;
pub const MAX_GAIN: i8 = 10;

/// One of the three tone bands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Band {
    Bass,
    Treble,
    Eq,
}

impl Band {
    /// Chain order
    pub const ALL: [Band; 3] = [Band::Bass, Band::Treble, Band::Eq];

    fn index(self) -> usize {
        match self {
            Band::Bass => 0,
            Band::Treble => 1,
            Band::Eq => 2,
        }
    }

    /// Butterworth design for this band at `sample_rate`
    pub fn design(self, sample_rate: u32) -> SosFilter {
        let nyquist = sample_rate as f64 / 2.0;
        let kind = match self {
            Band::Bass => ButterworthKind::LowPass(BASS_CUTOFF_HZ as f64 / nyquist),
            Band::Treble => ButterworthKind::HighPass(TREBLE_CUTOFF_HZ as f64 / nyquist),
            Band::Eq => {
                ButterworthKind::BandPass(EQ_LOW_HZ as f64 / nyquist, EQ_HIGH_HZ as f64 / nyquist)
            }
        };
        SosFilter::butterworth(kind)
    }
}

impl std::fmt::Display for Band {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Band::Bass => write!(f, "bass"),
            Band::Treble => write!(f, "treble"),
            Band::Eq => write!(f, "eq"),
        }
    }
}

/// Gains of the three bands for one input
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ToneGains {
    pub bass: i8,
    pub treble: i8,
    pub eq: i8,
}

impl ToneGains {
    pub fn new(bass: i8, treble: i8, eq: i8) -> Self {
        Self { bass, treble, eq }
    }

    pub fn get(&self, band: Band) -> i8 {
        match band {
            Band::Bass => self.bass,
            Band::Treble => self.treble,
            Band::Eq => self.eq,
        }
    }

    /// True when every band is bypassed
    pub fn is_flat(&self) -> bool {
        self.bass == 0 && self.treble == 0 && self.eq == 0
    }
}

/// Whether a band gain is within -10..=10
pub fn is_valid_gain(gain: i8) -> bool {
    (MIN_GAIN..=MAX_GAIN).contains(&gain)
}

/// Run one band over a block in place, from the history in `state`
fn apply_band_with(block: &mut StereoBuffer, filter: &SosFilter, state: &mut SosState, gain: i8) {
    let wet = gain.clamp(MIN_GAIN, MAX_GAIN) as f32 / 10.0;
    for frame in block.iter_mut() {
        let filtered = filter.tick(state, *frame);
        *frame += filtered * wet;
    }
}

/// Run one band over a block from zero history
fn apply_band(block: &mut StereoBuffer, band: Band, gain: i8, sample_rate: u32) {
    if gain == 0 {
        return;
    }
    let filter = band.design(sample_rate);
    let mut state = filter.new_state();
    apply_band_with(block, &filter, &mut state, gain);
}

/// Add the 200 Hz low-passed signal scaled by `gain / 10`
pub fn apply_bass(block: &mut StereoBuffer, gain: i8, sample_rate: u32) {
    apply_band(block, Band::Bass, gain, sample_rate);
}

/// Add the 4 kHz high-passed signal scaled by `gain / 10`
pub fn apply_treble(block: &mut StereoBuffer, gain: i8, sample_rate: u32) {
    apply_band(block, Band::Treble, gain, sample_rate);
}

/// Add the 500 Hz to 2 kHz band-passed signal scaled by `gain / 10`
pub fn apply_eq(block: &mut StereoBuffer, gain: i8, sample_rate: u32) {
    apply_band(block, Band::Eq, gain, sample_rate);
}

/// Per-input filter state with cached coefficients and output
///
/// The mix worker calls [`FilterBank::process`] every tick; the filtered block
/// is only recomputed when the captured block (by sequence number) or the
/// gains changed since the last call.
pub struct FilterBank {
    memory: FilterMemory,
    filters: [SosFilter; 3],
    /// History after the last processed block
    state: [SosState; 3],
    /// History before the last processed block
    checkpoint: [SosState; 3],
    last: Option<(u64, ToneGains)>,
    output: StereoBuffer,
}

impl FilterBank {
    pub fn new(sample_rate: u32, block_size: usize, memory: FilterMemory) -> Self {
        let filters = Band::ALL.map(|band| band.design(sample_rate));
        let state = [0, 1, 2].map(|i| filters[i].new_state());
        let checkpoint = state.clone();
        Self {
            memory,
            filters,
            state,
            checkpoint,
            last: None,
            output: StereoBuffer::silence(block_size),
        }
    }

    /// Result of the last [`process`](Self::process) call
    pub fn output(&self) -> &StereoBuffer {
        &self.output
    }

    /// Forget history and the cached output
    pub fn reset(&mut self) {
        for state in self.state.iter_mut().chain(self.checkpoint.iter_mut()) {
            state.reset();
        }
        self.last = None;
        self.output.fill_silence();
    }

    /// Filtered copy of `input`, recomputed only when `sequence` or `gains` changed
    pub fn process(&mut self, input: &StereoBuffer, sequence: u64, gains: ToneGains) -> &StereoBuffer {
        if self.last == Some((sequence, gains)) && self.output.len() == input.len() {
            return &self.output;
        }
        let same_block = matches!(self.last, Some((seq, _)) if seq == sequence);

        match self.memory {
            FilterMemory::PerBlock => {
                for state in &mut self.state {
                    state.reset();
                }
            }
            FilterMemory::Continuous => {
                if same_block {
                    // Gains changed on a block we already filtered: rerun it
                    // from the history it started with
                    for (state, saved) in self.state.iter_mut().zip(&self.checkpoint) {
                        state.copy_from(saved);
                    }
                } else {
                    for (saved, state) in self.checkpoint.iter_mut().zip(&self.state) {
                        saved.copy_from(state);
                    }
                }
                for band in Band::ALL {
                    if gains.get(band) == 0 {
                        self.state[band.index()].reset();
                    }
                }
            }
        }

        if self.output.len() != input.len() {
            self.output = StereoBuffer::silence(input.len());
        }
        self.output.copy_from(input);
        for band in Band::ALL {
            let gain = gains.get(band);
            if gain != 0 {
                let i = band.index();
                apply_band_with(&mut self.output, &self.filters[i], &mut self.state[i], gain);
            }
        }

        self.last = Some((sequence, gains));
        &self.output
    }
}
