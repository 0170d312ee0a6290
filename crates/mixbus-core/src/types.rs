//! Common types for Mixbus
//!
//! The fundamental audio types shared by the filter bank, the mixer and the
//! device adapter: stereo samples, fixed-length stereo blocks and slot
//! identifiers.

use std::fmt;
use std::ops::{Index, IndexMut};

/// Default engine sample rate (48kHz)
pub const DEFAULT_SAMPLE_RATE: u32 = 48000;

/// Default block size in frames
///
/// 4096 frames @ 48kHz is ~85ms; block boundaries are inaudible at this size
/// even with per-block filter memory.
pub const DEFAULT_BLOCK_SIZE: u32 = 4096;

/// Default number of input slots
pub const DEFAULT_NUM_INPUTS: usize = 4;

/// Default number of output buses
pub const DEFAULT_NUM_OUTPUTS: usize = 6;

/// Upper bound on output buses (routing flags are stored as a 32-bit mask)
pub const MAX_OUTPUTS: usize = 32;

/// Every stream the engine opens is stereo
pub const CHANNELS: u16 = 2;

/// Audio sample type
pub type Sample = f32;

/// A single stereo sample (left and right channels)
///
/// `#[repr(C)]` keeps the layout `[left, right]` so a `&[StereoSample]` can be
/// viewed as interleaved `&[f32]` through bytemuck without copying.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct StereoSample {
    pub left: Sample,
    pub right: Sample,
}

impl StereoSample {
    #[inline]
    pub fn new(left: Sample, right: Sample) -> Self {
        Self { left, right }
    }

    #[inline]
    pub fn silence() -> Self {
        Self::default()
    }

    /// Same value in both channels (used for mono capture devices)
    #[inline]
    pub fn mono(value: Sample) -> Self {
        Self { left: value, right: value }
    }
}

impl std::ops::Add for StereoSample {
    type Output = Self;

    #[inline]
    fn add(self, other: Self) -> Self {
        Self {
            left: self.left + other.left,
            right: self.right + other.right,
        }
    }
}

impl std::ops::AddAssign for StereoSample {
    #[inline]
    fn add_assign(&mut self, other: Self) {
        self.left += other.left;
        self.right += other.right;
    }
}

impl std::ops::Mul<Sample> for StereoSample {
    type Output = Self;

    #[inline]
    fn mul(self, factor: Sample) -> Self {
        Self {
            left: self.left * factor,
            right: self.right * factor,
        }
    }
}

impl std::ops::MulAssign<Sample> for StereoSample {
    #[inline]
    fn mul_assign(&mut self, factor: Sample) {
        self.left *= factor;
        self.right *= factor;
    }
}

/// A block of stereo samples
///
/// All blocks that flow through the mixer have the engine's block size.
/// Methods that take a second block expect equal lengths.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StereoBuffer {
    samples: Vec<StereoSample>,
}

/// The unit the engine captures, mixes and plays back
pub type AudioBlock = StereoBuffer;

impl StereoBuffer {
    /// Create a block filled with silence
    pub fn silence(len: usize) -> Self {
        Self {
            samples: vec![StereoSample::silence(); len],
        }
    }

    /// Create a block from interleaved samples [L, R, L, R, ...]
    pub fn from_interleaved(interleaved: &[Sample]) -> Self {
        assert!(interleaved.len() % 2 == 0, "Interleaved buffer must have even length");
        Self {
            samples: bytemuck::cast_slice(interleaved).to_vec(),
        }
    }

    /// Create a block from an existing Vec of StereoSamples
    pub fn from_vec(samples: Vec<StereoSample>) -> Self {
        Self { samples }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Fill the block with silence (keeps length and capacity)
    pub fn fill_silence(&mut self) {
        self.samples.fill(StereoSample::silence());
    }

    /// True when every sample is exactly zero
    pub fn is_silent(&self) -> bool {
        self.samples.iter().all(|s| s.left == 0.0 && s.right == 0.0)
    }

    #[inline]
    pub fn as_slice(&self) -> &[StereoSample] {
        &self.samples
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [StereoSample] {
        &mut self.samples
    }

    /// Zero-copy view as interleaved f32 [L, R, L, R, ...]
    #[inline]
    pub fn as_interleaved(&self) -> &[Sample] {
        bytemuck::cast_slice(&self.samples)
    }

    /// Zero-copy mutable view as interleaved f32 [L, R, L, R, ...]
    #[inline]
    pub fn as_interleaved_mut(&mut self) -> &mut [Sample] {
        bytemuck::cast_slice_mut(&mut self.samples)
    }

    /// Copy from another block of the same length (never allocates)
    #[inline]
    pub fn copy_from(&mut self, other: &StereoBuffer) {
        self.copy_from_slice(&other.samples);
    }

    /// Copy from a slice of the same length (never allocates)
    #[inline]
    pub fn copy_from_slice(&mut self, samples: &[StereoSample]) {
        self.samples.copy_from_slice(samples);
    }

    /// `self += other * factor`
    pub fn add_scaled(&mut self, other: &StereoBuffer, factor: Sample) {
        assert_eq!(self.len(), other.len(), "Block lengths must match");
        for (dst, src) in self.samples.iter_mut().zip(other.samples.iter()) {
            *dst += *src * factor;
        }
    }

    /// Scale all samples by a factor
    pub fn scale(&mut self, factor: Sample) {
        for sample in &mut self.samples {
            *sample *= factor;
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &StereoSample> {
        self.samples.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut StereoSample> {
        self.samples.iter_mut()
    }

    /// Per-channel RMS as (left, right)
    pub fn rms(&self) -> (Sample, Sample) {
        stereo_rms(&self.samples)
    }
}

/// Per-channel RMS of a run of stereo samples; silence for an empty slice
pub fn stereo_rms(samples: &[StereoSample]) -> (Sample, Sample) {
    if samples.is_empty() {
        return (0.0, 0.0);
    }
    let (sum_l, sum_r) = samples.iter().fold((0.0f32, 0.0f32), |(l, r), s| {
        (l + s.left * s.left, r + s.right * s.right)
    });
    let n = samples.len() as f32;
    ((sum_l / n).sqrt(), (sum_r / n).sqrt())
}

impl Index<usize> for StereoBuffer {
    type Output = StereoSample;

    #[inline]
    fn index(&self, index: usize) -> &Self::Output {
        &self.samples[index]
    }
}

impl IndexMut<usize> for StereoBuffer {
    #[inline]
    fn index_mut(&mut self, index: usize) -> &mut Self::Output {
        &mut self.samples[index]
    }
}

/// Stream direction of a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Input,
    Output,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Input => write!(f, "input"),
            Direction::Output => write!(f, "output"),
        }
    }
}

/// Identifies one input slot or output bus (0-based)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId {
    pub direction: Direction,
    pub index: usize,
}

impl SlotId {
    pub fn input(index: usize) -> Self {
        Self { direction: Direction::Input, index }
    }

    pub fn output(index: usize) -> Self {
        Self { direction: Direction::Output, index }
    }

    /// 1-based number shown to users ("Input 1", "Output 6")
    pub fn display_number(&self) -> usize {
        self.index + 1
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.direction, self.display_number())
    }
}
