//! Tone filters applied to each input before mixing

mod biquad;
mod filter_bank;

pub use biquad::{Biquad, ButterworthKind, SosFilter, SosState};
pub use filter_bank::{
    apply_bass, apply_eq, apply_treble, is_valid_gain, Band, FilterBank, ToneGains,
    BASS_CUTOFF_HZ, EQ_HIGH_HZ, EQ_LOW_HZ, MAX_GAIN, MIN_GAIN, TREBLE_CUTOFF_HZ,
};
