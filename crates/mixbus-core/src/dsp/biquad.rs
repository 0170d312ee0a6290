//! Second-order sections and Butterworth design
//!
//! Designs follow the classic analog route: 2nd-order Butterworth prototype,
//! band transform, bilinear transform with pre-warping, then grouping into
//! biquad sections. Coefficients and filter history are f64; the audio path
//! stays f32.

use num_complex::Complex64;
use std::f64::consts::PI;

use crate::types::StereoSample;

/// Imaginary parts below this are treated as real roots
const ROOT_EPSILON: f64 = 1e-12;

/// Bilinear transform runs at a normalized rate of 2 so that cutoffs are
/// fractions of Nyquist
const DESIGN_RATE: f64 = 2.0;

/// Band shape of a Butterworth design
///
/// Frequencies are normalized to Nyquist and must lie strictly within (0, 1).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ButterworthKind {
    LowPass(f64),
    HighPass(f64),
    BandPass(f64, f64),
}

/// One biquad, `y = b0 x + b1 x[-1] + b2 x[-2] - a1 y[-1] - a2 y[-2]`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Biquad {
    pub b0: f64,
    pub b1: f64,
    pub b2: f64,
    pub a1: f64,
    pub a2: f64,
}

impl Biquad {
    /// Section from two zeros and two poles, with `gain` on the numerator
    fn from_roots(zeros: (Complex64, Complex64), poles: (Complex64, Complex64), gain: f64) -> Self {
        let (z1, z2) = zeros;
        let (p1, p2) = poles;
        Self {
            b0: gain,
            b1: -gain * (z1 + z2).re,
            b2: gain * (z1 * z2).re,
            a1: -(p1 + p2).re,
            a2: (p1 * p2).re,
        }
    }

    /// Complex response at `z^-1 = e^{-jw}`
    fn response(&self, z_inv: Complex64) -> Complex64 {
        let z_inv2 = z_inv * z_inv;
        let num = self.b0 + z_inv * self.b1 + z_inv2 * self.b2;
        let den = Complex64::new(1.0, 0.0) + z_inv * self.a1 + z_inv2 * self.a2;
        num / den
    }
}

/// Direct form I history of one biquad on one channel
#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct History {
    x1: f64,
    x2: f64,
    y1: f64,
    y2: f64,
}

impl History {
    #[inline]
    fn tick(&mut self, q: &Biquad, x: f64) -> f64 {
        let y = q.b0 * x + q.b1 * self.x1 + q.b2 * self.x2 - q.a1 * self.y1 - q.a2 * self.y2;
        self.x2 = self.x1;
        self.x1 = x;
        self.y2 = self.y1;
        self.y1 = y;
        y
    }
}

/// Cascade of biquads
#[derive(Debug, Clone, PartialEq)]
pub struct SosFilter {
    sections: Vec<Biquad>,
}

/// Per-channel history for every section of a [`SosFilter`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SosState {
    left: Vec<History>,
    right: Vec<History>,
}

impl SosState {
    pub fn new(sections: usize) -> Self {
        Self {
            left: vec![History::default(); sections],
            right: vec![History::default(); sections],
        }
    }

    /// Forget all history
    pub fn reset(&mut self) {
        self.left.fill(History::default());
        self.right.fill(History::default());
    }

    /// Copy history from another state of the same shape (never allocates)
    pub fn copy_from(&mut self, other: &SosState) {
        self.left.copy_from_slice(&other.left);
        self.right.copy_from_slice(&other.right);
    }

    pub fn is_reset(&self) -> bool {
        self.left
            .iter()
            .chain(self.right.iter())
            .all(|h| *h == History::default())
    }
}

impl SosFilter {
    /// 2nd-order Butterworth prototype design (a band-pass comes out 4th order)
    pub fn butterworth(kind: ButterworthKind) -> Self {
        let prototype = Zpk::butterworth_prototype();
        let analog = match kind {
            ButterworthKind::LowPass(wn) => prototype.lp2lp(prewarp(wn)),
            ButterworthKind::HighPass(wn) => prototype.lp2hp(prewarp(wn)),
            ButterworthKind::BandPass(low, high) => {
                let (w1, w2) = (prewarp(low), prewarp(high));
                prototype.lp2bp((w1 * w2).sqrt(), w2 - w1)
            }
        };
        analog.bilinear().into_sos()
    }

    pub fn sections(&self) -> &[Biquad] {
        &self.sections
    }

    pub fn new_state(&self) -> SosState {
        SosState::new(self.sections.len())
    }

    /// Filter one stereo frame
    #[inline]
    pub fn tick(&self, state: &mut SosState, frame: StereoSample) -> StereoSample {
        let mut left = frame.left as f64;
        let mut right = frame.right as f64;
        for (i, section) in self.sections.iter().enumerate() {
            left = state.left[i].tick(section, left);
            right = state.right[i].tick(section, right);
        }
        StereoSample::new(left as f32, right as f32)
    }

    /// Magnitude response at `freq_hz` for a stream at `sample_rate`
    pub fn magnitude_at(&self, freq_hz: f64, sample_rate: u32) -> f64 {
        let w = 2.0 * PI * freq_hz / sample_rate as f64;
        let z_inv = Complex64::from_polar(1.0, -w);
        self.sections
            .iter()
            .fold(Complex64::new(1.0, 0.0), |acc, s| acc * s.response(z_inv))
            .norm()
    }
}

/// Analog-domain pre-warp of a Nyquist-normalized frequency
fn prewarp(wn: f64) -> f64 {
    2.0 * DESIGN_RATE * (PI * wn / DESIGN_RATE).tan()
}

/// Zeros, poles and gain of a filter
#[derive(Debug, Clone)]
struct Zpk {
    zeros: Vec<Complex64>,
    poles: Vec<Complex64>,
    gain: f64,
}

impl Zpk {
    /// Analog 2nd-order Butterworth low-pass with unit cutoff
    fn butterworth_prototype() -> Self {
        let poles = [-1.0f64, 1.0]
            .iter()
            .map(|m| -Complex64::from_polar(1.0, PI * m / 4.0))
            .collect();
        Self {
            zeros: Vec::new(),
            poles,
            gain: 1.0,
        }
    }

    fn relative_degree(&self) -> usize {
        self.poles.len() - self.zeros.len()
    }

    fn lp2lp(self, wo: f64) -> Self {
        let degree = self.relative_degree() as i32;
        Self {
            zeros: self.zeros.iter().map(|z| *z * wo).collect(),
            poles: self.poles.iter().map(|p| *p * wo).collect(),
            gain: self.gain * wo.powi(degree),
        }
    }

    fn lp2hp(self, wo: f64) -> Self {
        let degree = self.relative_degree();
        let num: Complex64 = self.zeros.iter().map(|z| -*z).product();
        let den: Complex64 = self.poles.iter().map(|p| -*p).product();

        let mut zeros: Vec<Complex64> = self.zeros.iter().map(|z| wo / *z).collect();
        zeros.extend(std::iter::repeat(Complex64::new(0.0, 0.0)).take(degree));
        Self {
            zeros,
            poles: self.poles.iter().map(|p| wo / *p).collect(),
            gain: self.gain * (num / den).re,
        }
    }

    fn lp2bp(self, wo: f64, bw: f64) -> Self {
        let degree = self.relative_degree();
        let split = |roots: &[Complex64]| -> Vec<Complex64> {
            let scaled: Vec<Complex64> = roots.iter().map(|r| *r * (bw / 2.0)).collect();
            let offsets: Vec<Complex64> =
                scaled.iter().map(|r| (*r * *r - wo * wo).sqrt()).collect();
            scaled
                .iter()
                .zip(&offsets)
                .map(|(r, o)| *r + *o)
                .chain(scaled.iter().zip(&offsets).map(|(r, o)| *r - *o))
                .collect()
        };

        let mut zeros = split(&self.zeros);
        zeros.extend(std::iter::repeat(Complex64::new(0.0, 0.0)).take(degree));
        Self {
            zeros,
            poles: split(&self.poles),
            gain: self.gain * bw.powi(degree as i32),
        }
    }

    fn bilinear(self) -> Self {
        let fs2 = Complex64::new(2.0 * DESIGN_RATE, 0.0);
        let degree = self.relative_degree();
        let num: Complex64 = self.zeros.iter().map(|z| fs2 - *z).product();
        let den: Complex64 = self.poles.iter().map(|p| fs2 - *p).product();

        let mut zeros: Vec<Complex64> = self.zeros.iter().map(|z| (fs2 + *z) / (fs2 - *z)).collect();
        zeros.extend(std::iter::repeat(Complex64::new(-1.0, 0.0)).take(degree));
        Self {
            zeros,
            poles: self.poles.iter().map(|p| (fs2 + *p) / (fs2 - *p)).collect(),
            gain: self.gain * (num / den).re,
        }
    }

    /// Group conjugate pole pairs into sections; section `i` takes zeros
    /// `i` and `i + n` so each numerator mixes the two zero groups
    fn into_sos(self) -> SosFilter {
        let mut pairs: Vec<(Complex64, Complex64)> = self
            .poles
            .iter()
            .filter(|p| p.im > ROOT_EPSILON)
            .map(|p| (*p, p.conj()))
            .collect();
        let reals: Vec<Complex64> = self
            .poles
            .iter()
            .filter(|p| p.im.abs() <= ROOT_EPSILON)
            .map(|p| Complex64::new(p.re, 0.0))
            .collect();
        for chunk in reals.chunks(2) {
            let second = chunk.get(1).copied().unwrap_or_default();
            pairs.push((chunk[0], second));
        }

        let n = pairs.len();
        let zero_at = |i: usize| self.zeros.get(i).copied().unwrap_or_default();
        let sections = pairs
            .into_iter()
            .enumerate()
            .map(|(i, poles)| {
                let gain = if i == 0 { self.gain } else { 1.0 };
                Biquad::from_roots((zero_at(i), zero_at(i + n)), poles, gain)
            })
            .collect();
        SosFilter { sections }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SR: u32 = 48000;

    fn close(a: f64, b: f64, tol: f64) -> bool {
        (a - b).abs() <= tol
    }

    /// Closed-form bilinear 2nd-order Butterworth (a1, a2, norm)
    fn reference_denominator(cutoff: f64) -> (f64, f64, f64, f64) {
        let k = (PI * cutoff / SR as f64).tan();
        let norm = 1.0 / (1.0 + std::f64::consts::SQRT_2 * k + k * k);
        let a1 = 2.0 * (k * k - 1.0) * norm;
        let a2 = (1.0 - std::f64::consts::SQRT_2 * k + k * k) * norm;
        (k, norm, a1, a2)
    }

    #[test]
    fn test_lowpass_matches_closed_form() {
        let filter = SosFilter::butterworth(ButterworthKind::LowPass(200.0 / 24000.0));
        assert_eq!(filter.sections().len(), 1);

        let (k, norm, a1, a2) = reference_denominator(200.0);
        let q = filter.sections()[0];
        assert!(close(q.b0, k * k * norm, 1e-12));
        assert!(close(q.b1, 2.0 * k * k * norm, 1e-12));
        assert!(close(q.b2, k * k * norm, 1e-12));
        assert!(close(q.a1, a1, 1e-9));
        assert!(close(q.a2, a2, 1e-9));
    }

    #[test]
    fn test_highpass_matches_closed_form() {
        let filter = SosFilter::butterworth(ButterworthKind::HighPass(4000.0 / 24000.0));
        let (_, norm, a1, a2) = reference_denominator(4000.0);
        let q = filter.sections()[0];
        assert!(close(q.b0, norm, 1e-9));
        assert!(close(q.b1, -2.0 * norm, 1e-9));
        assert!(close(q.b2, norm, 1e-9));
        assert!(close(q.a1, a1, 1e-9));
        assert!(close(q.a2, a2, 1e-9));
    }

    #[test]
    fn test_bandpass_is_fourth_order_with_unit_peak() {
        let filter = SosFilter::butterworth(ButterworthKind::BandPass(500.0 / 24000.0, 2000.0 / 24000.0));
        assert_eq!(filter.sections().len(), 2);

        assert!(filter.magnitude_at(0.0, SR) < 1e-9);
        assert!(filter.magnitude_at(23999.0, SR) < 1e-3);
        assert!(close(filter.magnitude_at(1000.0, SR), 1.0, 0.01));
        // Band edges sit at -3 dB
        assert!(close(filter.magnitude_at(500.0, SR), std::f64::consts::FRAC_1_SQRT_2, 0.01));
        assert!(close(filter.magnitude_at(2000.0, SR), std::f64::consts::FRAC_1_SQRT_2, 0.01));
    }

    #[test]
    fn test_cutoff_is_minus_three_db() {
        let low = SosFilter::butterworth(ButterworthKind::LowPass(200.0 / 24000.0));
        let high = SosFilter::butterworth(ButterworthKind::HighPass(4000.0 / 24000.0));

        assert!(close(low.magnitude_at(0.0, SR), 1.0, 1e-9));
        assert!(close(low.magnitude_at(200.0, SR), std::f64::consts::FRAC_1_SQRT_2, 1e-6));
        assert!(close(high.magnitude_at(4000.0, SR), std::f64::consts::FRAC_1_SQRT_2, 1e-6));
        assert!(close(high.magnitude_at(24000.0, SR), 1.0, 1e-9));
    }

    #[test]
    fn test_state_reset_and_copy() {
        let filter = SosFilter::butterworth(ButterworthKind::LowPass(0.1));
        let mut state = filter.new_state();
        assert!(state.is_reset());

        filter.tick(&mut state, StereoSample::new(1.0, -1.0));
        assert!(!state.is_reset());

        let mut saved = filter.new_state();
        saved.copy_from(&state);
        assert_eq!(saved, state);

        state.reset();
        assert!(state.is_reset());
    }
}
